//! Error types for store operations
//!
//! Callers discriminate on the variant, never on message text. Lookup
//! misses are expressed as `Ok(None)` rather than an error; duplicate
//! keys from the step table are converted to a boolean at the storage
//! boundary and never surface here.

use thiserror::Error;

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors produced by [`crate::store::JobStore`] implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Caller-side validation failure
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    /// A conditional update matched zero rows: the caller no longer
    /// owns the job (lease expired, another worker settled it, or the
    /// row is already terminal). Always non-fatal.
    #[error("{0} rejected: job is not RUNNING or does not exist")]
    StaleState(&'static str),

    /// Backend I/O failure
    #[error("storage: {0:#}")]
    Storage(anyhow::Error),
}

impl StoreError {
    /// Wrap a backend error as a `storage` failure.
    pub fn storage(err: impl Into<anyhow::Error>) -> Self {
        Self::Storage(err.into())
    }

    /// Check if this error means the caller lost ownership of the job
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleState(_))
    }
}
