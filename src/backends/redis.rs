//! Redis cache backend implementation.
//!
//! This backend stores cache entries as expiring Redis string keys and tag
//! relations as Redis sets, sharing one cache across many processes. Writes
//! are pipelined: a save submits its `SETEX`/`SADD`/`SREM` burst in one
//! round-trip and reads the replies back as a burst.
//!
//! # Eviction and durability
//!
//! Tag sets carry no expiry, so they must outlive the items they
//! reference. Two rules enforce that:
//!
//! * The server's `maxmemory-policy` must be `noeviction` or one of the
//!   `volatile-*` family. Anything else (an `allkeys-*` variant) could
//!   evict a tag set before its items and is rejected with a
//!   configuration error.
//! * Every item gets a TTL. A save with no expiry is clamped to
//!   [`DEFAULT_CACHE_TTL`] so server-side eviction always prefers items
//!   over the non-volatile tag sets.
//!
//! # Invalidation
//!
//! Invalidating a tag is two-phase. The tag set is first `RENAME`d under a
//! random suffix (the `{...}` hash-tag keeps the renamed key on the same
//! cluster slot); items tagged after the rename land in a fresh set under
//! the original name and survive. The renamed snapshot is then read with
//! `SMEMBERS` and its members (plus the snapshot keys themselves) are
//! deleted in chunks of [`BULK_DELETE_LIMIT`].

use crate::backends::{RecordStream, TagAwareBackend, TagMap};
#[cfg(feature = "bincode")]
use crate::marshal::BincodeMarshaller;
use crate::marshal::{Marshaller, StoredRecord};
use crate::metrics::Metrics;
use crate::naming;
use crate::{error::Error, Result};
use async_trait::async_trait;
use futures::stream;
use redis::aio::ConnectionManager;
use redis::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// TTL floor, in seconds, applied to items saved without an expiry
/// (100 days). Items must expire so eviction prefers them over tag sets.
pub const DEFAULT_CACHE_TTL: u64 = 8_640_000;

/// Maximum number of keys deleted per `DEL` during tag invalidation.
const BULK_DELETE_LIMIT: usize = 10_000;

fn eviction_policy_is_safe(policy: &str) -> bool {
    policy == "noeviction" || policy.starts_with("volatile-")
}

/// Redis-based tag-aware cache backend.
///
/// # Example
///
/// ```rust,no_run
/// use tagcache::backends::redis::RedisBackend;
/// use tagcache::{PoolConfig, TagAwarePool};
///
/// # async fn run() -> tagcache::Result<()> {
/// let backend = RedisBackend::connect("redis://127.0.0.1:6379").await?;
/// let config = PoolConfig::new().namespace("myapp");
/// let mut pool = TagAwarePool::new(backend, config)?;
///
/// let mut item = pool.get_item("user.42").await?;
/// item.set(b"profile bytes".to_vec());
/// item.tag("users")?;
/// pool.save(item).await?;
/// # Ok(())
/// # }
/// ```
pub struct RedisBackend {
    /// Multiplexed connection shared by all operations.
    conn: ConnectionManager,
    /// Codec for stored records.
    marshaller: Arc<dyn Marshaller>,
    /// Cache metrics.
    metrics: Metrics,
    /// `maxmemory-policy` observed at construction, re-checked on save.
    eviction_policy: String,
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend")
            .field("eviction_policy", &self.eviction_policy)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connects to the given Redis URL with the default marshaller.
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established or the
    /// server's eviction policy would discard tag sets.
    #[cfg(feature = "bincode")]
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_marshaller(url, Arc::new(BincodeMarshaller::new())).await
    }

    /// Connects to the given Redis URL with an explicit marshaller.
    pub async fn connect_with_marshaller(
        url: &str,
        marshaller: Arc<dyn Marshaller>,
    ) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Backend(format!("failed to create Redis client: {}", e)))?;
        Self::with_client(client, marshaller).await
    }

    /// Builds a backend from an existing client handle.
    pub async fn with_client(
        client: redis::Client,
        marshaller: Arc<dyn Marshaller>,
    ) -> Result<Self> {
        let mut conn = client
            .get_tokio_connection_manager()
            .await
            .map_err(|e| Error::Backend(format!("failed to connect to Redis: {}", e)))?;

        let eviction_policy = Self::fetch_eviction_policy(&mut conn).await;
        let backend = Self {
            conn,
            marshaller,
            metrics: Metrics::new(),
            eviction_policy,
        };
        backend.check_eviction_policy()?;
        Ok(backend)
    }

    /// Returns the metrics collected by this backend.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    async fn fetch_eviction_policy(conn: &mut ConnectionManager) -> String {
        let reply: redis::RedisResult<HashMap<String, String>> = redis::cmd("CONFIG")
            .arg("GET")
            .arg("maxmemory-policy")
            .query_async(conn)
            .await;
        match reply {
            Ok(mut map) => map
                .remove("maxmemory-policy")
                .unwrap_or_else(|| "noeviction".to_string()),
            Err(err) => {
                // Managed servers often refuse CONFIG; nothing to verify then.
                warn!(%err, "could not read maxmemory-policy; assuming noeviction");
                "noeviction".to_string()
            }
        }
    }

    fn check_eviction_policy(&self) -> Result<()> {
        if eviction_policy_is_safe(&self.eviction_policy) {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "Redis maxmemory-policy `{}` can evict tag sets before items; \
                 use `noeviction` or a `volatile-*` policy",
                self.eviction_policy
            )))
        }
    }

    fn convert_redis_error(err: redis::RedisError) -> Error {
        Error::Backend(format!("Redis error: {}", err))
    }

    async fn delete_ids(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(ids)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(Self::convert_redis_error)
    }
}

#[async_trait]
impl TagAwareBackend for RedisBackend {
    async fn do_fetch(&self, ids: Vec<String>) -> Result<RecordStream> {
        if ids.is_empty() {
            return Ok(Box::pin(stream::empty()));
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(&ids)
            .query_async(&mut conn)
            .await
            .map_err(Self::convert_redis_error)?;

        let mut found = Vec::new();
        for (id, value) in ids.into_iter().zip(values) {
            match value {
                Some(bytes) => match self.marshaller.decode(&bytes) {
                    Ok(record) => {
                        self.metrics.record_hit();
                        found.push((id, record));
                    }
                    Err(err) => {
                        self.metrics.record_miss();
                        warn!(id = %id, %err, "stored record failed to decode; treating as miss");
                    }
                },
                None => self.metrics.record_miss(),
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
        self.check_eviction_policy()?;

        let (encoded, mut failed) = self.marshaller.encode(records);
        if encoded.is_empty() {
            return Ok(failed);
        }

        // Items always expire so eviction prefers them over tag sets.
        let ttl = if ttl == 0 { DEFAULT_CACHE_TTL } else { ttl };

        let mut pipe = redis::pipe();
        let mut record_order = Vec::with_capacity(encoded.len());
        for (id, payload) in &encoded {
            pipe.cmd("SETEX").arg(id).arg(ttl).arg(payload.as_slice());
            record_order.push(id.clone());
        }
        for (tag_id, ids) in &add_tag_data {
            // Ids whose records could not be marshalled are skipped.
            let members: Vec<&str> = ids
                .iter()
                .filter(|id| !failed.contains(*id))
                .map(String::as_str)
                .collect();
            if !members.is_empty() {
                pipe.cmd("SADD").arg(tag_id).arg(members);
            }
        }
        for (tag_id, ids) in &remove_tag_data {
            let members: Vec<&str> = ids
                .iter()
                .filter(|id| !failed.contains(*id))
                .map(String::as_str)
                .collect();
            if !members.is_empty() {
                pipe.cmd("SREM").arg(tag_id).arg(members);
            }
        }

        let mut conn = self.conn.clone();
        let replies: Vec<Value> = pipe
            .query_async(&mut conn)
            .await
            .map_err(Self::convert_redis_error)?;

        // The first replies belong to the SETEX commands, in submission
        // order; numeric replies further down are SADD/SREM counts.
        for (i, id) in record_order.into_iter().enumerate() {
            match replies.get(i) {
                Some(Value::Okay) => self.metrics.record_insertion(),
                Some(Value::Status(status)) if status == "OK" => self.metrics.record_insertion(),
                _ => failed.push(id),
            }
        }

        Ok(failed)
    }

    async fn do_delete(&self, ids: Vec<String>) -> Result<bool> {
        self.delete_ids(&ids).await?;
        Ok(true)
    }

    async fn do_delete_tag_relations(&self, tag_data: TagMap) -> Result<bool> {
        if tag_data.is_empty() {
            return Ok(true);
        }
        let mut pipe = redis::pipe();
        for (tag_id, ids) in &tag_data {
            if !ids.is_empty() {
                pipe.cmd("SREM").arg(tag_id).arg(ids);
            }
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(Self::convert_redis_error)?;
        Ok(true)
    }

    async fn do_invalidate(&self, tag_ids: Vec<String>) -> Result<bool> {
        if tag_ids.is_empty() {
            return Ok(true);
        }
        let mut conn = self.conn.clone();

        // Phase 1: move each tag set aside under a unique name. A rename
        // fails when the tag has no set; such tags are simply skipped.
        // Writers SADD-ing the original name from here on build a fresh
        // set that this invalidation never touches.
        let mut renamed = Vec::with_capacity(tag_ids.len());
        for tag_id in &tag_ids {
            let snapshot = format!("{{{}}}{:016x}", tag_id, rand::random::<u64>());
            let reply: redis::RedisResult<()> = redis::cmd("RENAME")
                .arg(tag_id)
                .arg(&snapshot)
                .query_async(&mut conn)
                .await;
            match reply {
                Ok(()) => renamed.push(snapshot),
                Err(err) => debug!(tag_id = %tag_id, %err, "tag set absent or rename failed; skipping"),
            }
        }
        if renamed.is_empty() {
            return Ok(true);
        }

        // Phase 2: read the snapshots and purge their members together
        // with the snapshot keys themselves.
        let mut pipe = redis::pipe();
        for snapshot in &renamed {
            pipe.cmd("SMEMBERS").arg(snapshot);
        }
        let member_sets: Vec<Vec<String>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(Self::convert_redis_error)?;

        let mut doomed: HashSet<String> = renamed.into_iter().collect();
        for members in member_sets {
            doomed.extend(members);
        }
        let doomed: Vec<String> = doomed.into_iter().collect();
        for chunk in doomed.chunks(BULK_DELETE_LIMIT) {
            self.delete_ids(chunk).await?;
        }
        Ok(true)
    }

    async fn clear(&self, namespace: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        if namespace.is_empty() {
            warn!("clearing entire Redis database; no namespace configured");
            return redis::cmd("FLUSHDB")
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(Self::convert_redis_error);
        }

        // Item and tag keys carry distinct prefixes; sweep both patterns.
        for prefix in [
            naming::item_prefix(namespace),
            naming::tag_prefix(namespace),
        ] {
            let pattern = format!("{}*", prefix);
            let keys: Vec<String> = redis::cmd("KEYS")
                .arg(&pattern)
                .query_async(&mut conn)
                .await
                .map_err(Self::convert_redis_error)?;
            for chunk in keys.chunks(BULK_DELETE_LIMIT) {
                self.delete_ids(chunk).await?;
            }
        }
        Ok(())
    }
}

// These tests require a running Redis instance on the default port.
#[cfg(all(test, feature = "bincode"))]
mod integration_tests {
    use super::*;
    use crate::{PoolConfig, TagAwarePool};
    use serial_test::serial;

    const URL: &str = "redis://127.0.0.1:6379";
    const NS: &str = "tagcache-test";

    async fn test_pool() -> TagAwarePool<RedisBackend> {
        let backend = RedisBackend::connect(URL).await.unwrap();
        let mut pool = TagAwarePool::new(backend, PoolConfig::new().namespace(NS)).unwrap();
        pool.clear().await.unwrap();
        pool
    }

    async fn put(pool: &mut TagAwarePool<RedisBackend>, key: &str, value: &[u8], tags: &[&str]) {
        let mut item = pool.get_item(key).await.unwrap();
        item.set(value.to_vec());
        for tag in tags {
            item.tag(*tag).unwrap();
        }
        assert!(pool.save(item).await.unwrap());
    }

    async fn raw_conn() -> ConnectionManager {
        redis::Client::open(URL)
            .unwrap()
            .get_tokio_connection_manager()
            .await
            .unwrap()
    }

    #[tokio::test]
    #[serial]
    #[ignore]
    async fn test_round_trip_with_tags() {
        let mut pool = test_pool().await;

        put(&mut pool, "k1", b"v1", &["a", "b"]).await;

        let item = pool.get_item("k1").await.unwrap();
        assert!(item.is_hit());
        assert_eq!(item.value(), Some(&b"v1"[..]));
        assert!(item.prev_tags().contains("a"));
        assert!(item.prev_tags().contains("b"));
    }

    #[tokio::test]
    #[serial]
    #[ignore]
    async fn test_shared_tag_invalidation() {
        let mut pool = test_pool().await;

        put(&mut pool, "k1", b"v1", &["a", "b"]).await;
        put(&mut pool, "k2", b"v2", &["b", "c"]).await;
        put(&mut pool, "k3", b"v3", &["c"]).await;

        assert!(pool.invalidate_tags(&["b"]).await.unwrap());

        assert!(!pool.get_item("k1").await.unwrap().is_hit());
        assert!(!pool.get_item("k2").await.unwrap().is_hit());
        assert!(pool.get_item("k3").await.unwrap().is_hit());
    }

    #[tokio::test]
    #[serial]
    #[ignore]
    async fn test_tag_diff_moves_item_between_tags() {
        let mut pool = test_pool().await;

        put(&mut pool, "k", b"v", &["a"]).await;

        let mut item = pool.get_item("k").await.unwrap();
        item.tag("b").unwrap();
        assert!(pool.save(item).await.unwrap());

        assert!(pool.invalidate_tags(&["a"]).await.unwrap());
        assert!(pool.get_item("k").await.unwrap().is_hit());

        assert!(pool.invalidate_tags(&["b"]).await.unwrap());
        assert!(!pool.get_item("k").await.unwrap().is_hit());
    }

    #[tokio::test]
    #[serial]
    #[ignore]
    async fn test_delete_detaches_the_item_from_its_tag_set() {
        let mut pool = test_pool().await;

        put(&mut pool, "k1", b"v1", &["t"]).await;
        put(&mut pool, "k2", b"v2", &["t"]).await;

        assert!(pool.delete_items(&["k1"]).await.unwrap());

        let mut conn = raw_conn().await;
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(crate::naming::tag_id(NS, "t"))
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(members, vec![crate::naming::item_id(NS, "k2")]);
    }

    #[tokio::test]
    #[serial]
    #[ignore]
    async fn test_items_without_expiry_get_the_ttl_floor() {
        let mut pool = test_pool().await;

        put(&mut pool, "k", b"v", &[]).await;

        let mut conn = raw_conn().await;
        let ttl: i64 = redis::cmd("TTL")
            .arg(crate::naming::item_id(NS, "k"))
            .query_async(&mut conn)
            .await
            .unwrap();
        assert!(ttl >= 1);
        assert!(ttl as u64 <= DEFAULT_CACHE_TTL);
    }

    #[tokio::test]
    #[serial]
    #[ignore]
    async fn test_fresh_tag_set_survives_the_next_invalidation() {
        let mut pool = test_pool().await;

        put(&mut pool, "k1", b"v1", &["x"]).await;
        assert!(pool.invalidate_tags(&["x"]).await.unwrap());

        put(&mut pool, "k2", b"v2", &["x"]).await;
        assert!(pool.get_item("k2").await.unwrap().is_hit());

        assert!(pool.invalidate_tags(&["x"]).await.unwrap());
        assert!(!pool.get_item("k2").await.unwrap().is_hit());
    }

    #[tokio::test]
    #[serial]
    #[ignore]
    async fn test_mass_invalidation_sweeps_every_bearer() {
        let mut pool = test_pool().await;

        put(&mut pool, "seed", b"v", &["x"]).await;

        // 25_000 more bearers force the purge through its 10_000-key
        // delete chunks.
        let keys: Vec<String> = (0..25_000).map(|i| format!("bulk.{}", i)).collect();
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        for mut item in pool.get_items(&key_refs).await.unwrap() {
            item.set(b"v".to_vec());
            item.tag("x").unwrap();
            pool.save_deferred(item);
        }
        assert!(pool.commit().await.unwrap());

        assert!(pool.invalidate_tags(&["x"]).await.unwrap());
        assert!(!pool.get_item("seed").await.unwrap().is_hit());
        assert!(!pool.get_item("bulk.0").await.unwrap().is_hit());
        assert!(!pool.get_item("bulk.24999").await.unwrap().is_hit());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eviction_policy_rules() {
        assert!(eviction_policy_is_safe("noeviction"));
        assert!(eviction_policy_is_safe("volatile-lru"));
        assert!(eviction_policy_is_safe("volatile-ttl"));
        assert!(!eviction_policy_is_safe("allkeys-lru"));
        assert!(!eviction_policy_is_safe("allkeys-random"));
    }

    #[test]
    fn test_snapshot_key_keeps_hash_tag() {
        // The braces force the snapshot onto the same cluster slot as the
        // operations that follow it.
        let tag_id = "ns\0tags\0x";
        let snapshot = format!("{{{}}}{:016x}", tag_id, 0u64);
        assert!(snapshot.starts_with("{ns\0tags\0x}"));
    }
}
