//! The tag-aware cache pool.
//!
//! The pool is the shared upper layer over every backend: it owns the
//! deferred write buffer, bins items by effective TTL, computes tag diffs
//! from the tags observed at fetch time, drives the commit with bulk-first
//! then per-item retry, and exposes the public cache interface.
//!
//! One pool instance is single-threaded cooperative: its methods take
//! `&mut self` and it performs no internal locking. The backend underneath
//! is the shared resource; many pools in many processes may point at the
//! same directory or Redis database concurrently.

use crate::backends::{TagAwareBackend, TagMap};
use crate::config::PoolConfig;
use crate::item::CacheItem;
use crate::marshal::StoredRecord;
use crate::{naming, Result};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// One record scheduled for storage during a commit, with its sideband tag
/// operations already namespaced.
#[derive(Debug, Clone)]
struct PendingSave {
    id: String,
    record: StoredRecord,
    add_tags: Vec<String>,
    remove_tags: Vec<String>,
    ttl: u64,
}

/// A tag-aware cache pool over a storage backend.
///
/// # Examples
///
/// ```no_run
/// use tagcache::{FilesystemBackend, PoolConfig, TagAwarePool};
///
/// # async fn example() -> tagcache::Result<()> {
/// let backend = FilesystemBackend::new(None)?;
/// let mut pool = TagAwarePool::new(backend, PoolConfig::new().namespace("app"))?;
///
/// let mut item = pool.get_item("news.latest").await?;
/// item.set(b"headline".to_vec());
/// item.tag("news")?;
/// pool.save(item).await?;
///
/// // Later: evict everything tagged `news` in one operation.
/// pool.invalidate_tags(&["news"]).await?;
/// assert!(!pool.get_item("news.latest").await?.is_hit());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct TagAwarePool<B: TagAwareBackend> {
    backend: B,
    namespace: String,
    default_lifetime: Duration,
    deferred: HashMap<String, CacheItem>,
}

impl<B: TagAwareBackend> TagAwarePool<B> {
    /// Creates a pool over `backend`.
    ///
    /// # Errors
    /// Returns an error if the configured namespace is invalid.
    pub fn new(backend: B, config: PoolConfig) -> Result<Self> {
        naming::validate_namespace(&config.namespace)?;
        Ok(Self {
            backend,
            namespace: config.namespace,
            default_lifetime: config.default_lifetime,
            deferred: HashMap::new(),
        })
    }

    /// Returns the underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Fetches one item, returning a miss shell when the key is absent.
    ///
    /// Pending deferred saves are committed first so a writer observes its
    /// own writes. Backend trouble during the fetch is logged and reported
    /// as a miss, never raised.
    ///
    /// # Errors
    /// Returns an error if the key is invalid, or if the implied commit
    /// hits a fatal backend misconfiguration.
    pub async fn get_item(&mut self, key: &str) -> Result<CacheItem> {
        let mut items = self.get_items(&[key]).await?;
        match items.pop() {
            Some(item) => Ok(item),
            None => Ok(CacheItem::miss(key, self.default_lifetime)),
        }
    }

    /// Fetches several items at once.
    ///
    /// Hits come first in the order the backend yields them, followed by a
    /// miss shell for every remaining key in input order. Duplicate keys
    /// collapse to one item.
    pub async fn get_items(&mut self, keys: &[&str]) -> Result<Vec<CacheItem>> {
        for key in keys {
            naming::validate_key(key)?;
        }
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        if !self.deferred.is_empty() {
            self.commit().await?;
        }

        let ids: Vec<String> = keys
            .iter()
            .map(|key| naming::item_id(&self.namespace, key))
            .collect();
        let key_by_id: HashMap<&str, &str> = ids
            .iter()
            .map(String::as_str)
            .zip(keys.iter().copied())
            .collect();

        let mut items = Vec::with_capacity(keys.len());
        let mut seen: HashSet<String> = HashSet::with_capacity(keys.len());

        match self.backend.do_fetch(ids.clone()).await {
            Ok(mut records) => {
                while let Some((id, record)) = records.next().await {
                    if let Some(key) = key_by_id.get(id.as_str()) {
                        if seen.insert(id.clone()) {
                            items.push(CacheItem::hit(key, record, self.default_lifetime));
                        }
                    }
                }
            }
            Err(err) => {
                warn!(%err, count = keys.len(), "fetch failed; reporting requested keys as misses");
            }
        }

        for (id, key) in ids.iter().zip(keys) {
            if seen.insert(id.clone()) {
                items.push(CacheItem::miss(key, self.default_lifetime));
            }
        }
        Ok(items)
    }

    /// Whether a key currently resolves to a hit.
    pub async fn has_item(&mut self, key: &str) -> Result<bool> {
        Ok(self.get_item(key).await?.is_hit())
    }

    /// Buffers an item and commits the whole deferred buffer.
    pub async fn save(&mut self, item: CacheItem) -> Result<bool> {
        self.save_deferred(item);
        self.commit().await
    }

    /// Buffers an item for a later [`commit`](Self::commit). A second save
    /// under the same key replaces the first.
    pub fn save_deferred(&mut self, item: CacheItem) -> bool {
        self.deferred.insert(item.key().to_string(), item);
        true
    }

    /// Drains the deferred buffer to the backend.
    ///
    /// Items are binned by effective TTL; already-expired items are
    /// bulk-deleted instead of stored. Each bin is saved in one backend
    /// call; when a pipelined bin fails without per-item diagnostics,
    /// every item in it is retried individually. Returns `true` iff no
    /// save failure was recorded. Committing an empty buffer is a no-op
    /// returning `true`.
    ///
    /// # Errors
    /// Only fatal misconfiguration (unwritable directory, unsafe eviction
    /// policy) is raised; everything else is absorbed into the returned
    /// flag.
    pub async fn commit(&mut self) -> Result<bool> {
        let deferred = std::mem::take(&mut self.deferred);
        if deferred.is_empty() {
            return Ok(true);
        }

        let now = SystemTime::now();
        let mut expired = Vec::new();
        let mut bins: HashMap<u64, Vec<PendingSave>> = HashMap::new();

        for (key, item) in deferred {
            let id = naming::item_id(&self.namespace, &key);
            let ttl = match item.expiry() {
                None => item.default_lifetime().as_secs(),
                Some(when) => match when.duration_since(now) {
                    Ok(left) => left.as_secs().max(1),
                    Err(_) => {
                        // Already expired: an immediate delete, not a save.
                        expired.push(id);
                        continue;
                    }
                },
            };
            let record = StoredRecord {
                value: item.value().map(|v| v.to_vec()).unwrap_or_default(),
                tags: item.tags().clone(),
            };
            let add_tags = item
                .tags()
                .difference(item.prev_tags())
                .map(|tag| naming::tag_id(&self.namespace, tag))
                .collect();
            let remove_tags = item
                .prev_tags()
                .difference(item.tags())
                .map(|tag| naming::tag_id(&self.namespace, tag))
                .collect();
            bins.entry(ttl).or_default().push(PendingSave {
                id,
                record,
                add_tags,
                remove_tags,
                ttl,
            });
        }

        if !expired.is_empty() {
            if let Err(err) = self.backend.do_delete(expired).await {
                warn!(%err, "failed to delete expired deferred items");
            }
        }

        let mut ok = true;
        let mut retries = Vec::new();
        for (ttl, batch) in bins {
            match self.save_batch(&batch, ttl).await {
                Ok(failed) => {
                    for id in failed {
                        ok = false;
                        warn!(id = %id, "failed to store cache item");
                    }
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) if batch.len() > 1 => {
                    // The batch failed as a whole with no per-item
                    // diagnostics; degrade to individual saves.
                    debug!(%err, count = batch.len(), "bulk save failed; retrying items individually");
                    retries.extend(batch);
                }
                Err(err) => {
                    ok = false;
                    warn!(id = %batch[0].id, %err, "failed to store cache item");
                }
            }
        }

        for pending in retries {
            let ttl = pending.ttl;
            let batch = [pending];
            match self.save_batch(&batch, ttl).await {
                Ok(failed) if failed.is_empty() => {}
                Ok(_) => {
                    ok = false;
                    warn!(id = %batch[0].id, "failed to store cache item");
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    ok = false;
                    warn!(id = %batch[0].id, %err, "failed to store cache item");
                }
            }
        }

        Ok(ok)
    }

    async fn save_batch(&self, batch: &[PendingSave], ttl: u64) -> Result<Vec<String>> {
        let mut records = HashMap::with_capacity(batch.len());
        let mut add: TagMap = HashMap::new();
        let mut remove: TagMap = HashMap::new();
        for pending in batch {
            records.insert(pending.id.clone(), pending.record.clone());
            for tag in &pending.add_tags {
                add.entry(tag.clone()).or_default().push(pending.id.clone());
            }
            for tag in &pending.remove_tags {
                remove
                    .entry(tag.clone())
                    .or_default()
                    .push(pending.id.clone());
            }
        }
        self.backend.do_save(records, ttl, add, remove).await
    }

    /// Deletes one item. See [`delete_items`](Self::delete_items).
    pub async fn delete_item(&mut self, key: &str) -> Result<bool> {
        self.delete_items(&[key]).await
    }

    /// Deletes items and detaches them from their tags.
    ///
    /// Matching entries still sitting in the deferred buffer are dropped.
    /// The current tag memberships are fetched first so the relations can
    /// be cleaned up alongside the records. Unknown keys are not an
    /// error. Returns the conjunction of all per-item outcomes.
    pub async fn delete_items(&mut self, keys: &[&str]) -> Result<bool> {
        for key in keys {
            naming::validate_key(key)?;
        }
        if keys.is_empty() {
            return Ok(true);
        }

        let mut ids = Vec::with_capacity(keys.len());
        for key in keys {
            self.deferred.remove(*key);
            let id = naming::item_id(&self.namespace, key);
            if !ids.contains(&id) {
                ids.push(id);
            }
        }

        let mut tag_data: TagMap = HashMap::new();
        match self.backend.do_fetch(ids.clone()).await {
            Ok(mut records) => {
                while let Some((id, record)) = records.next().await {
                    for tag in &record.tags {
                        tag_data
                            .entry(naming::tag_id(&self.namespace, tag))
                            .or_default()
                            .push(id.clone());
                    }
                }
            }
            Err(err) => {
                // The relations dangle until the tag is invalidated;
                // readers tolerate that.
                warn!(%err, "could not fetch tag memberships before delete");
            }
        }

        let mut ok = match self.backend.do_delete(ids.clone()).await {
            Ok(deleted) => deleted,
            Err(err) => {
                warn!(%err, "bulk delete failed; retrying items individually");
                false
            }
        };
        if !ok {
            ok = true;
            for id in &ids {
                match self.backend.do_delete(vec![id.clone()]).await {
                    Ok(deleted) => ok &= deleted,
                    Err(err) => {
                        warn!(id = %id, %err, "failed to delete cache item");
                        ok = false;
                    }
                }
            }
        }

        if !tag_data.is_empty() {
            match self.backend.do_delete_tag_relations(tag_data).await {
                Ok(cleaned) => ok &= cleaned,
                Err(err) => {
                    warn!(%err, "failed to clean up tag relations");
                    ok = false;
                }
            }
        }

        Ok(ok)
    }

    /// Evicts every item tagged with any of `tags`.
    ///
    /// Items saved after the invalidation snapshot is taken survive, even
    /// under the same tag. An empty tag list is a no-op returning `false`.
    ///
    /// # Errors
    /// Returns an error if a tag name is invalid or the backend sweep
    /// cannot run at all.
    pub async fn invalidate_tags(&mut self, tags: &[&str]) -> Result<bool> {
        if tags.is_empty() {
            return Ok(false);
        }
        let mut seen = HashSet::with_capacity(tags.len());
        let mut tag_ids = Vec::with_capacity(tags.len());
        for tag in tags {
            naming::validate_tag(tag)?;
            if seen.insert(*tag) {
                tag_ids.push(naming::tag_id(&self.namespace, tag));
            }
        }
        self.backend.do_invalidate(tag_ids).await
    }

    /// Drops the deferred buffer and wipes the namespace's stored state.
    pub async fn clear(&mut self) -> Result<bool> {
        self.deferred.clear();
        self.backend.clear(&self.namespace).await?;
        Ok(true)
    }

    /// Best-effort teardown flush of the deferred buffer.
    ///
    /// Errors are logged and swallowed; call this before dropping a pool
    /// that may hold deferred saves.
    pub async fn close(&mut self) -> bool {
        if self.deferred.is_empty() {
            return true;
        }
        match self.commit().await {
            Ok(ok) => ok,
            Err(err) => {
                warn!(%err, "teardown commit failed; deferred items were lost");
                false
            }
        }
    }
}

impl<B: TagAwareBackend> Drop for TagAwarePool<B> {
    fn drop(&mut self) {
        if !self.deferred.is_empty() {
            warn!(
                count = self.deferred.len(),
                "pool dropped with uncommitted deferred items; call close() first"
            );
        }
    }
}
