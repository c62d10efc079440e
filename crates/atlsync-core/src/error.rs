use std::error::Error as StdError;

/// Errors surfaced by every storage backend through the [`crate::SyncStore`]
/// contract.
///
/// `Closed` and `NestedTransaction` indicate caller bugs and are raised
/// eagerly instead of silently no-opping. Backend-specific failures are boxed
/// behind `Backend` so no SQL or file-format type leaks through the contract.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store is closed")]
    Closed,
    #[error("nested transactions are not supported")]
    NestedTransaction,
    #[error("page not found: {0}")]
    PageNotFound(String),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn StdError + Send + Sync>),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Wrap a backend-specific error without exposing its concrete type.
    pub fn backend(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Backend(err.into())
    }
}
