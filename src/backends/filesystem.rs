//! Filesystem cache backend implementation.
//!
//! This backend stores cache entries as individual files under a rooted
//! directory and tag relations as symlinks, providing persistent storage
//! that survives application restarts and tag invalidation without any
//! index beyond the directory tree itself.
//!
//! # Features
//!
//! * Persistent storage with one file per item
//! * Atomic writes (write to a temporary file, then rename into place)
//! * Tag relations as one symlink per `(tag, item)` pair
//! * Snapshot-and-sweep tag invalidation that never blocks fresh writes
//! * Expired and corrupt files removed lazily on read
//! * Built-in metrics for hits, misses and insertions
//!
//! # Storage Format
//!
//! Two subtrees live under the configured root:
//!
//! * `<root>/<a>/<b>/<hash_tail>`: one file per item. `a` and `b` are the
//!   first two hex characters of a blake3 hash of the item id; the file
//!   name is the next twenty. Each file starts with a text header (the
//!   expiry as seconds since the epoch with `0` meaning none, a newline,
//!   the URL-encoded item id, a newline) followed by the marshalled
//!   record. The recorded id guards against hash collisions: a mismatch
//!   on read is treated as a miss and the file is discarded.
//! * `<root>/tags/<encoded_tag>/<link_name>`: one symlink per
//!   `(tag, item)` pair, pointing at the absolute path of the item file.
//!   The link name is the first twenty hex characters of the item-id hash.
//!
//! Invalidating a tag renames its directory to a random sibling name and
//! sweeps the snapshot, unlinking every target file and link. Writers that
//! attach the tag to new items concurrently recreate the original
//! directory, so those items survive the sweep.

use crate::backends::{RecordStream, TagAwareBackend, TagMap};
#[cfg(feature = "bincode")]
use crate::marshal::BincodeMarshaller;
use crate::marshal::{Marshaller, StoredRecord};
use crate::metrics::Metrics;
use crate::{error::Error, Result};
use async_trait::async_trait;
use futures::stream;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
#[cfg(unix)]
use std::os::unix::fs::symlink;
#[cfg(windows)]
use std::os::windows::fs::symlink_file as symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const TAG_DIR: &str = "tags";

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Filesystem-based tag-aware cache backend.
///
/// # Example
///
/// ```rust,no_run
/// use tagcache::backends::filesystem::FilesystemBackend;
/// use tagcache::{PoolConfig, TagAwarePool};
///
/// # async fn run() -> tagcache::Result<()> {
/// // Store the cache under a dedicated directory.
/// let backend = FilesystemBackend::new(Some("/var/cache/myapp".into()))?;
/// let mut pool = TagAwarePool::new(backend, PoolConfig::default())?;
///
/// let mut item = pool.get_item("report.today").await?;
/// item.set(b"rendered report".to_vec());
/// item.tag("reports")?;
/// pool.save(item).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct FilesystemBackend {
    /// Canonicalized cache root; item shards and the tag tree live below it.
    root: PathBuf,
    /// `<root>/tags`.
    tags_root: PathBuf,
    /// Codec for stored records.
    marshaller: Arc<dyn Marshaller>,
    /// Cache metrics.
    metrics: Metrics,
}

impl FilesystemBackend {
    /// Creates a backend rooted at `directory`, defaulting to
    /// `<system temp>/tagcache`.
    ///
    /// Pools with different namespaces sharing one backend still keep
    /// their ids apart, but [`clear`](TagAwareBackend::clear) wipes the
    /// whole root; give each namespace its own directory if that matters.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    #[cfg(feature = "bincode")]
    pub fn new(directory: Option<PathBuf>) -> Result<Self> {
        Self::with_marshaller(directory, Arc::new(BincodeMarshaller::new()))
    }

    /// Creates a backend with an explicit marshaller.
    pub fn with_marshaller(
        directory: Option<PathBuf>,
        marshaller: Arc<dyn Marshaller>,
    ) -> Result<Self> {
        let root = directory.unwrap_or_else(|| std::env::temp_dir().join("tagcache"));
        fs::create_dir_all(&root)?;
        // Symlink targets must be absolute so links stay valid regardless
        // of the process working directory.
        let root = root.canonicalize()?;
        let tags_root = root.join(TAG_DIR);

        Ok(Self {
            root,
            tags_root,
            marshaller,
            metrics: Metrics::new(),
        })
    }

    /// Returns the metrics collected by this backend.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn id_hash(id: &str) -> String {
        hex::encode(blake3::hash(id.as_bytes()).as_bytes())
    }

    /// Shard path of an item file: `<root>/<a>/<b>/<20-char tail>`.
    fn file_path(&self, id: &str) -> PathBuf {
        let hash = Self::id_hash(id);
        self.root
            .join(&hash[..1])
            .join(&hash[1..2])
            .join(&hash[2..22])
    }

    fn link_name(id: &str) -> String {
        Self::id_hash(id)[..20].to_string()
    }

    fn tag_dir(&self, tag_id: &str) -> PathBuf {
        self.tags_root.join(urlencoding::encode(tag_id).as_ref())
    }

    fn write_record(&self, path: &Path, id: &str, expires_at: u64, payload: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::Backend(format!("cache path {} has no parent", path.display())))?;
        fs::create_dir_all(parent)?;

        // Write-then-rename: concurrent writers to the same id can race,
        // but readers never observe a torn file.
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(format!("{}\n{}\n", expires_at, urlencoding::encode(id)).as_bytes())?;
        tmp.write_all(payload)?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Reads and validates one item file. Expired, corrupt and mismatched
    /// files are discarded and reported as `None`.
    fn read_record(&self, path: &Path, id: &str, now: u64) -> Result<Option<StoredRecord>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut parts = bytes.splitn(3, |b| *b == b'\n');
        let (expires_raw, id_raw, payload) = match (parts.next(), parts.next(), parts.next()) {
            (Some(e), Some(i), Some(p)) => (e, i, p),
            _ => {
                warn!(path = %path.display(), "cache file header is truncated; discarding");
                self.discard(path);
                return Ok(None);
            }
        };

        let expires_at = match std::str::from_utf8(expires_raw)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            Some(v) => v,
            None => {
                warn!(path = %path.display(), "cache file expiry header is unparseable; discarding");
                self.discard(path);
                return Ok(None);
            }
        };
        if expires_at != 0 && expires_at <= now {
            self.discard(path);
            return Ok(None);
        }

        let stored_id = std::str::from_utf8(id_raw)
            .ok()
            .and_then(|s| urlencoding::decode(s).ok());
        match stored_id {
            Some(stored) if stored == id => {}
            _ => {
                warn!(path = %path.display(), id = %id, "stored id does not match requested id; discarding");
                self.discard(path);
                return Ok(None);
            }
        }

        match self.marshaller.decode(payload) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(path = %path.display(), %err, "stored record failed to decode; discarding");
                self.discard(path);
                Ok(None)
            }
        }
    }

    fn discard(&self, path: &Path) {
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != io::ErrorKind::NotFound {
                debug!(path = %path.display(), %err, "failed to remove bad cache file");
            }
        }
    }

    fn root_writable(&self) -> bool {
        tempfile::tempfile_in(&self.root).is_ok()
    }
}

#[async_trait]
impl TagAwareBackend for FilesystemBackend {
    async fn do_fetch(&self, ids: Vec<String>) -> Result<RecordStream> {
        let now = unix_now();
        let mut found = Vec::new();
        for id in ids {
            let path = self.file_path(&id);
            match self.read_record(&path, &id, now) {
                Ok(Some(record)) => {
                    self.metrics.record_hit();
                    found.push((id, record));
                }
                Ok(None) => self.metrics.record_miss(),
                Err(err) => {
                    self.metrics.record_miss();
                    warn!(id = %id, %err, "failed to read cache file; treating as miss");
                }
            }
        }
        Ok(Box::pin(stream::iter(found)))
    }

    async fn do_save(
        &self,
        records: HashMap<String, StoredRecord>,
        ttl: u64,
        add_tag_data: TagMap,
        remove_tag_data: TagMap,
    ) -> Result<Vec<String>> {
        let (encoded, mut failed) = self.marshaller.encode(records);
        if encoded.is_empty() {
            return Ok(failed);
        }

        let expires_at = if ttl == 0 { 0 } else { unix_now() + ttl };
        let mut stored: HashMap<String, PathBuf> = HashMap::with_capacity(encoded.len());
        let mut write_failed = false;
        for (id, payload) in &encoded {
            let path = self.file_path(id);
            match self.write_record(&path, id, expires_at, payload) {
                Ok(()) => {
                    self.metrics.record_insertion();
                    stored.insert(id.clone(), path);
                }
                Err(err) => {
                    warn!(id = %id, %err, "failed to write cache file");
                    failed.push(id.clone());
                    write_failed = true;
                }
            }
        }
        if write_failed && !self.root_writable() {
            return Err(Error::Config(format!(
                "cache directory {} is not writable",
                self.root.display()
            )));
        }

        for (tag_id, ids) in &add_tag_data {
            let dir = self.tag_dir(tag_id);
            let mut dir_ready = false;
            for id in ids {
                // Ids that were not stored this round are skipped; the
                // caller's retry re-submits their tag operations.
                let target = match stored.get(id) {
                    Some(path) => path,
                    None => continue,
                };
                if !dir_ready {
                    if let Err(err) = fs::create_dir_all(&dir) {
                        warn!(tag_id = %tag_id, %err, "failed to create tag directory");
                        break;
                    }
                    dir_ready = true;
                }
                let link = dir.join(Self::link_name(id));
                match symlink(target, &link) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(err) => warn!(id = %id, tag_id = %tag_id, %err, "failed to create tag link"),
                }
            }
        }

        for (tag_id, ids) in &remove_tag_data {
            let dir = self.tag_dir(tag_id);
            for id in ids {
                let link = dir.join(Self::link_name(id));
                if let Err(err) = fs::remove_file(&link) {
                    if err.kind() != io::ErrorKind::NotFound {
                        debug!(id = %id, tag_id = %tag_id, %err, "failed to remove tag link");
                    }
                }
            }
        }

        Ok(failed)
    }

    async fn do_delete(&self, ids: Vec<String>) -> Result<bool> {
        let mut ok = true;
        for id in ids {
            let path = self.file_path(&id);
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(id = %id, %err, "failed to remove cache file");
                    ok = false;
                }
            }
        }
        Ok(ok)
    }

    async fn do_delete_tag_relations(&self, tag_data: TagMap) -> Result<bool> {
        for (tag_id, ids) in tag_data {
            let dir = self.tag_dir(&tag_id);
            for id in ids {
                let link = dir.join(Self::link_name(&id));
                if let Err(err) = fs::remove_file(&link) {
                    if err.kind() != io::ErrorKind::NotFound {
                        debug!(id = %id, tag_id = %tag_id, %err, "failed to remove tag link");
                    }
                }
            }
        }
        Ok(true)
    }

    async fn do_invalidate(&self, tag_ids: Vec<String>) -> Result<bool> {
        let mut ok = true;
        for tag_id in tag_ids {
            let dir = self.tag_dir(&tag_id);
            let sweep = self.tags_root.join(format!(
                "{}.{:016x}",
                urlencoding::encode(&tag_id),
                rand::random::<u64>()
            ));
            // Snapshot the directory under a random sibling name; writers
            // attaching the tag to new items recreate the original
            // directory and are untouched by the sweep.
            match fs::rename(&dir, &sweep) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => {
                    warn!(tag_id = %tag_id, %err, "failed to snapshot tag directory");
                    ok = false;
                    continue;
                }
            }

            let entries = match fs::read_dir(&sweep) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(tag_id = %tag_id, %err, "failed to read tag directory snapshot");
                    ok = false;
                    continue;
                }
            };
            for entry in entries.flatten() {
                let link = entry.path();
                if let Ok(target) = fs::read_link(&link) {
                    if let Err(err) = fs::remove_file(&target) {
                        if err.kind() != io::ErrorKind::NotFound {
                            warn!(target = %target.display(), %err, "failed to remove tagged cache file");
                            ok = false;
                        }
                    }
                }
                let _ = fs::remove_file(&link);
            }
            if let Err(err) = fs::remove_dir(&sweep) {
                debug!(%err, "failed to remove emptied tag snapshot directory");
            }
        }
        Ok(ok)
    }

    async fn clear(&self, _namespace: &str) -> Result<()> {
        // Item files are sharded by an id hash, so selecting by namespace
        // would mean reading every header; each namespace is expected to
        // use its own directory instead.
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs::create_dir_all(&self.root)?;
        Ok(())
    }
}

#[cfg(all(test, feature = "bincode"))]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn backend(dir: &Path) -> FilesystemBackend {
        FilesystemBackend::new(Some(dir.to_path_buf())).unwrap()
    }

    fn record(value: &[u8], tags: &[&str]) -> StoredRecord {
        StoredRecord {
            value: value.to_vec(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    async fn fetch_one(backend: &FilesystemBackend, id: &str) -> Option<StoredRecord> {
        let mut stream = backend.do_fetch(vec![id.to_string()]).await.unwrap();
        stream.next().await.map(|(_, record)| record)
    }

    #[test]
    fn test_path_sharding() {
        let temp = tempdir().unwrap();
        let backend = backend(temp.path());
        let path = backend.file_path("some-id");

        let relative = path.strip_prefix(&backend.root).unwrap();
        let parts: Vec<_> = relative.iter().map(|p| p.to_str().unwrap()).collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 1);
        assert_eq!(parts[1].len(), 1);
        assert_eq!(parts[2].len(), 20);
    }

    #[tokio::test]
    async fn test_save_and_fetch() {
        let temp = tempdir().unwrap();
        let backend = backend(temp.path());

        let records = HashMap::from([("id1".to_string(), record(b"v1", &["t1"]))]);
        let add = HashMap::from([("tag-a".to_string(), vec!["id1".to_string()])]);
        let failed = backend
            .do_save(records, 0, add, HashMap::new())
            .await
            .unwrap();
        assert!(failed.is_empty());

        let fetched = fetch_one(&backend, "id1").await.unwrap();
        assert_eq!(fetched.value, b"v1");
        assert_eq!(fetched.tags, HashSet::from(["t1".to_string()]));

        // The tag relation exists as a symlink named after the id hash.
        let link = backend.tag_dir("tag-a").join(FilesystemBackend::link_name("id1"));
        assert!(link.symlink_metadata().is_ok());
    }

    #[tokio::test]
    async fn test_expired_file_is_discarded_on_read() {
        let temp = tempdir().unwrap();
        let backend = backend(temp.path());

        let path = backend.file_path("id1");
        let payload = bincode::serialize(&record(b"v", &[])).unwrap();
        backend.write_record(&path, "id1", 1, &payload).unwrap();

        assert!(fetch_one(&backend, "id1").await.is_none());
        assert!(!path.exists());
        assert_eq!(backend.metrics().misses(), 1);
    }

    #[tokio::test]
    async fn test_mismatched_inner_id_is_a_miss() {
        let temp = tempdir().unwrap();
        let backend = backend(temp.path());

        // A file at id1's path recording a different inner id, as a hash
        // collision or a corrupted header would produce.
        let path = backend.file_path("id1");
        let payload = bincode::serialize(&record(b"v", &[])).unwrap();
        backend.write_record(&path, "other-id", 0, &payload).unwrap();

        assert!(fetch_one(&backend, "id1").await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_a_miss() {
        let temp = tempdir().unwrap();
        let backend = backend(temp.path());

        let path = backend.file_path("id1");
        backend.write_record(&path, "id1", 0, b"not a record").unwrap();

        assert!(fetch_one(&backend, "id1").await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_invalidate_sweeps_tagged_items() {
        let temp = tempdir().unwrap();
        let backend = backend(temp.path());

        let records = HashMap::from([
            ("id1".to_string(), record(b"v1", &["x"])),
            ("id2".to_string(), record(b"v2", &["x"])),
        ]);
        let add = HashMap::from([(
            "tag-x".to_string(),
            vec!["id1".to_string(), "id2".to_string()],
        )]);
        backend
            .do_save(records, 0, add, HashMap::new())
            .await
            .unwrap();

        assert!(backend.do_invalidate(vec!["tag-x".to_string()]).await.unwrap());
        assert!(fetch_one(&backend, "id1").await.is_none());
        assert!(fetch_one(&backend, "id2").await.is_none());
        // The original tag directory is gone along with the snapshot.
        assert!(!backend.tag_dir("tag-x").exists());

        // Re-invalidating an already-cleared tag is a no-op success.
        assert!(backend.do_invalidate(vec!["tag-x".to_string()]).await.unwrap());
    }

    #[tokio::test]
    async fn test_dangling_tag_link_is_tolerated() {
        let temp = tempdir().unwrap();
        let backend = backend(temp.path());

        let records = HashMap::from([("id1".to_string(), record(b"v1", &["x"]))]);
        let add = HashMap::from([("tag-x".to_string(), vec!["id1".to_string()])]);
        backend
            .do_save(records, 0, add, HashMap::new())
            .await
            .unwrap();

        // Delete the item individually; the tag link now dangles.
        assert!(backend.do_delete(vec!["id1".to_string()]).await.unwrap());
        assert!(backend.do_invalidate(vec!["tag-x".to_string()]).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_tag_data_unlinks_relation() {
        let temp = tempdir().unwrap();
        let backend = backend(temp.path());

        let records = HashMap::from([("id1".to_string(), record(b"v1", &["x"]))]);
        let add = HashMap::from([("tag-x".to_string(), vec!["id1".to_string()])]);
        backend
            .do_save(records, 0, add.clone(), HashMap::new())
            .await
            .unwrap();

        // Re-save without the tag: the relation is removed, the item stays.
        let records = HashMap::from([("id1".to_string(), record(b"v1", &[]))]);
        backend
            .do_save(records, 0, HashMap::new(), add)
            .await
            .unwrap();

        let link = backend.tag_dir("tag-x").join(FilesystemBackend::link_name("id1"));
        assert!(link.symlink_metadata().is_err());
        assert!(fetch_one(&backend, "id1").await.is_some());
    }

    #[tokio::test]
    async fn test_delete_unknown_ids_is_ok() {
        let temp = tempdir().unwrap();
        let backend = backend(temp.path());
        assert!(backend.do_delete(vec!["missing".to_string()]).await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_resets_root() {
        let temp = tempdir().unwrap();
        let backend = backend(temp.path());

        let records = HashMap::from([("id1".to_string(), record(b"v1", &[]))]);
        backend
            .do_save(records, 0, HashMap::new(), HashMap::new())
            .await
            .unwrap();

        backend.clear("").await.unwrap();
        assert!(fetch_one(&backend, "id1").await.is_none());
    }
}
