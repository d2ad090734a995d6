//! Error types for the tagcache library.

use std::fmt;

/// The main error type for the tagcache library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A key, tag or namespace contained reserved or control characters,
    /// or exceeded a length limit.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An error that occurred while marshalling or unmarshalling a record.
    #[error("codec error: {0}")]
    Codec(String),

    /// The backend returned a transient error.
    #[error("backend error: {0}")]
    Backend(String),

    /// The backend is misconfigured (unwritable cache directory, eviction
    /// policy that would discard tag sets). Not retryable.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O error from the filesystem backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Creates a new backend error.
    pub fn backend<E: fmt::Display>(error: E) -> Self {
        Self::Backend(error.to_string())
    }

    /// Creates a new codec error.
    pub fn codec<E: fmt::Display>(error: E) -> Self {
        Self::Codec(error.to_string())
    }

    /// Whether the error must abort the current operation instead of being
    /// absorbed by the per-item retry path.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

/// A specialized `Result` type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;
