#![warn(missing_docs)]
//! # tagcache
//!
//! A tag-aware cache pool: every stored item may carry a set of symbolic
//! tags, and everything bearing a given tag can be invalidated in a single
//! operation, without scanning the cache.
//!
//! ## Features
//!
//! - **Tag-based Invalidation**: evict whole groups of items at once; items
//!   tagged after the invalidation snapshot survive
//! - **Pluggable Backends**: filesystem (tag relations as symlinks) and
//!   Redis (tag relations as sets), sharing one pool layer
//! - **Deferred Writes**: buffer saves and commit them in TTL-binned bulk
//!   operations, with per-item retry when a pipelined batch fails opaquely
//! - **Namespacing**: ids are prefixed so pools sharing a backend can never
//!   collide, and item ids can never collide with tag ids
//! - **Crash Tolerance**: write-then-rename on disk, expiring items under
//!   non-expiring tag sets on Redis, dangling tag relations tolerated
//!   everywhere
//!
//! ## Quick Start
//!
//! ```no_run
//! use tagcache::{FilesystemBackend, PoolConfig, TagAwarePool};
//!
//! # async fn example() -> tagcache::Result<()> {
//! let backend = FilesystemBackend::new(None)?;
//! let mut pool = TagAwarePool::new(backend, PoolConfig::default())?;
//!
//! // Cache two renderings, both tagged with the author.
//! let mut page = pool.get_item("page.home").await?;
//! page.set(b"<html>home</html>".to_vec());
//! page.tag("author.7")?;
//! pool.save(page).await?;
//!
//! let mut feed = pool.get_item("feed.rss").await?;
//! feed.set(b"<rss/>".to_vec());
//! feed.tag("author.7")?;
//! pool.save(feed).await?;
//!
//! // The author changed their name: both renderings vanish together.
//! pool.invalidate_tags(&["author.7"]).await?;
//! assert!(!pool.get_item("page.home").await?.is_hit());
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod config;
pub mod error;
pub mod item;
pub mod marshal;
pub mod metrics;
pub mod naming;
pub mod pool;

pub use config::PoolConfig;
pub use error::Error;
pub use item::CacheItem;
pub use pool::TagAwarePool;

// Re-export backends for easier access
#[cfg(feature = "filesystem-backend")]
pub use backends::filesystem::FilesystemBackend;
#[cfg(feature = "redis-backend")]
pub use backends::redis::RedisBackend;

/// The main cache result type.
pub type Result<T> = std::result::Result<T, error::Error>;

/// Common prelude for using the library.
pub mod prelude {
    pub use crate::{
        backends::TagAwareBackend,
        config::PoolConfig,
        error::Error,
        item::CacheItem,
        marshal::{Marshaller, StoredRecord},
        pool::TagAwarePool,
        Result,
    };

    #[cfg(feature = "filesystem-backend")]
    pub use crate::backends::filesystem::FilesystemBackend;
    #[cfg(feature = "redis-backend")]
    pub use crate::backends::redis::RedisBackend;
}
