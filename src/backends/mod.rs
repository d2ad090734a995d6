//! Backend implementations for the tag-aware storage protocols.

use crate::marshal::StoredRecord;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::{collections::HashMap, fmt::Debug};

#[cfg(feature = "filesystem-backend")]
pub mod filesystem;
#[cfg(feature = "redis-backend")]
pub mod redis;

/// Tag relations keyed by tag id: each entry maps a tag id to the item ids
/// being attached to (or detached from) that tag.
pub type TagMap = HashMap<String, Vec<String>>;

/// The stream of `(item id, record)` pairs produced by a fetch. Ids that
/// are absent, expired or unreadable are simply not yielded.
pub type RecordStream = BoxStream<'static, (String, StoredRecord)>;

/// Storage driver for a tag-aware pool.
///
/// The pool owns the deferred buffer, TTL binning, tag diffing and retry;
/// a backend only persists bytes and tag relations. All ids and tag ids
/// arriving here are already namespaced by the pool.
///
/// Implementations must tolerate dangling tag relations: a tag may
/// transiently reference an item that has expired or been deleted
/// individually, and readers of the relation skip such entries.
#[async_trait]
pub trait TagAwareBackend: Send + Sync + Debug {
    /// Fetches the stored records for `ids`.
    ///
    /// Per-id problems (missing, expired, corrupt, undecodable) are handled
    /// internally and reported by omission; an `Err` means the fetch as a
    /// whole could not be performed.
    async fn do_fetch(&self, ids: Vec<String>) -> crate::Result<RecordStream>;

    /// Persists `records` with the given TTL (seconds; `0` = no expiry)
    /// and applies the sideband tag operations.
    ///
    /// `add_tag_data` and `remove_tag_data` are scoped to the ids in
    /// `records`. Returns the ids that could not be stored; the caller
    /// retries them individually. An `Err` of kind
    /// [`Config`](crate::Error::Config) is fatal and must not be retried.
    async fn do_save(
        &self,
        records: HashMap<String, StoredRecord>,
        ttl: u64,
        add_tag_data: TagMap,
        remove_tag_data: TagMap,
    ) -> crate::Result<Vec<String>>;

    /// Removes the stored records for `ids`. Missing ids are not an error.
    /// Returns `false` if a present record could not be removed.
    async fn do_delete(&self, ids: Vec<String>) -> crate::Result<bool>;

    /// Detaches item ids from tags. Missing relations are not an error;
    /// this is best-effort cleanup since readers tolerate dangling
    /// relations.
    async fn do_delete_tag_relations(&self, tag_data: TagMap) -> crate::Result<bool>;

    /// Evicts every item referenced by any of `tag_ids`, and the tag
    /// relations themselves. Items attached to a tag after the
    /// invalidation snapshot is taken survive.
    async fn do_invalidate(&self, tag_ids: Vec<String>) -> crate::Result<bool>;

    /// Wipes everything stored under `namespace`; with an empty namespace,
    /// wipes the whole store.
    async fn clear(&self, namespace: &str) -> crate::Result<()>;
}
