//! The cache item data model.

use crate::marshal::StoredRecord;
use crate::{naming, Result};
use std::collections::HashSet;
use std::time::{Duration, SystemTime};

/// A single cache entry: a key, an opaque payload and a set of tags.
///
/// Items are only minted by a pool ([`crate::TagAwarePool::get_item`]
/// returns a miss shell for absent keys), so every item carries a
/// validated key and the pool's default lifetime. Saving an item back
/// through the same pool attaches the payload and tags currently set on
/// it.
///
/// # Examples
///
/// ```no_run
/// use tagcache::{FilesystemBackend, PoolConfig, TagAwarePool};
///
/// # async fn example() -> tagcache::Result<()> {
/// let backend = FilesystemBackend::new(None)?;
/// let mut pool = TagAwarePool::new(backend, PoolConfig::default())?;
///
/// let mut item = pool.get_item("user.42").await?;
/// if !item.is_hit() {
///     item.set(b"profile bytes".to_vec());
///     item.tag("users")?;
///     pool.save(item).await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CacheItem {
    key: String,
    value: Option<Vec<u8>>,
    tags: HashSet<String>,
    expiry: Option<SystemTime>,
    default_lifetime: Duration,
    prev_tags: HashSet<String>,
    is_hit: bool,
}

impl CacheItem {
    /// Builds the miss shell returned for keys absent from the backend.
    pub(crate) fn miss(key: &str, default_lifetime: Duration) -> Self {
        Self {
            key: key.to_string(),
            value: None,
            tags: HashSet::new(),
            expiry: None,
            default_lifetime,
            prev_tags: HashSet::new(),
            is_hit: false,
        }
    }

    /// Builds a hit from a fetched record. The record's tags become the
    /// previously-observed set; the current set starts empty, so tags must
    /// be re-declared on every save and dropped tags turn into removals at
    /// commit time.
    pub(crate) fn hit(key: &str, record: StoredRecord, default_lifetime: Duration) -> Self {
        Self {
            key: key.to_string(),
            value: Some(record.value),
            tags: HashSet::new(),
            expiry: None,
            default_lifetime,
            prev_tags: record.tags,
            is_hit: true,
        }
    }

    /// The user-visible key of this item.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The payload, or `None` when the item is a miss with no value set yet.
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Whether this item was produced from a successful fetch.
    pub fn is_hit(&self) -> bool {
        self.is_hit
    }

    /// The tags currently attached to this item.
    pub fn tags(&self) -> &HashSet<String> {
        &self.tags
    }

    /// The tags the item carried when it was last fetched from the backend.
    ///
    /// Empty for items that were never fetched; the commit protocol diffs
    /// this set against [`tags`](Self::tags) to derive tag adds and removes
    /// without re-reading storage.
    pub fn prev_tags(&self) -> &HashSet<String> {
        &self.prev_tags
    }

    /// The absolute expiry, if one was set explicitly.
    pub fn expiry(&self) -> Option<SystemTime> {
        self.expiry
    }

    /// The lifetime applied when no explicit expiry is set. Zero means no
    /// expiry (subject to any floor the backend enforces).
    pub fn default_lifetime(&self) -> Duration {
        self.default_lifetime
    }

    /// Replaces the payload.
    pub fn set(&mut self, value: Vec<u8>) -> &mut Self {
        self.value = Some(value);
        self
    }

    /// Attaches a tag. Duplicates are ignored; the tag name is validated
    /// against the same charset rules as keys.
    pub fn tag(&mut self, tag: impl Into<String>) -> Result<&mut Self> {
        let tag = tag.into();
        naming::validate_tag(&tag)?;
        self.tags.insert(tag);
        Ok(self)
    }

    /// Sets an absolute expiry. `None` reverts to the default lifetime.
    pub fn expires_at(&mut self, when: Option<SystemTime>) -> &mut Self {
        self.expiry = when;
        self
    }

    /// Sets the expiry relative to now. `None` reverts to the default
    /// lifetime.
    pub fn expires_after(&mut self, ttl: Option<Duration>) -> &mut Self {
        self.expiry = ttl.map(|d| SystemTime::now() + d);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miss_shell() {
        let item = CacheItem::miss("k", Duration::from_secs(60));
        assert_eq!(item.key(), "k");
        assert!(!item.is_hit());
        assert!(item.value().is_none());
        assert!(item.tags().is_empty());
        assert!(item.prev_tags().is_empty());
        assert_eq!(item.default_lifetime(), Duration::from_secs(60));
    }

    #[test]
    fn test_hit_snapshots_prev_tags() {
        let record = StoredRecord {
            value: b"v".to_vec(),
            tags: ["a", "b"].into_iter().map(String::from).collect(),
        };
        let mut item = CacheItem::hit("k", record, Duration::ZERO);
        assert!(item.is_hit());
        assert_eq!(item.value(), Some(&b"v"[..]));

        // The fetched tags are only the previous-observation snapshot;
        // the current set starts empty and is rebuilt by the caller.
        assert!(item.tags().is_empty());
        assert_eq!(item.prev_tags().len(), 2);

        item.tag("c").unwrap();
        assert_eq!(item.tags().len(), 1);
        assert_eq!(item.prev_tags().len(), 2);
    }

    #[test]
    fn test_tag_validation() {
        let mut item = CacheItem::miss("k", Duration::ZERO);
        assert!(item.tag("ok-tag").is_ok());
        assert!(item.tag("not:ok").is_err());
        assert!(item.tag("").is_err());
        assert_eq!(item.tags().len(), 1);
    }

    #[test]
    fn test_duplicate_tags_collapse() {
        let mut item = CacheItem::miss("k", Duration::ZERO);
        item.tag("t").unwrap();
        item.tag("t").unwrap();
        assert_eq!(item.tags().len(), 1);
    }

    #[test]
    fn test_expiry_setters() {
        let mut item = CacheItem::miss("k", Duration::ZERO);
        assert!(item.expiry().is_none());
        item.expires_after(Some(Duration::from_secs(5)));
        assert!(item.expiry().is_some());
        item.expires_after(None);
        assert!(item.expiry().is_none());
    }
}
