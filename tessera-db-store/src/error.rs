//! Error types for the store core

use thiserror::Error;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// Serialization conflict: an observed read pattern was invalidated by a
    /// concurrently flushed sink. Callers should treat this as "retry the
    /// transaction", never as an I/O failure.
    #[error("Serialization conflict: {0}")]
    Conflict(String),

    /// Backing-store or I/O failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Operation on a closed sink, dataset, or source
    #[error("Already closed: {0}")]
    Closed(String),

    /// Requested isolation level cannot be honored by the backing store
    #[error("Unsupported isolation level: {0}")]
    UnsupportedIsolation(String),
}

impl StoreError {
    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a closed error
    pub fn closed(what: impl Into<String>) -> Self {
        Self::Closed(what.into())
    }

    /// Create an unsupported-isolation error
    pub fn unsupported_isolation(msg: impl Into<String>) -> Self {
        Self::UnsupportedIsolation(msg.into())
    }

    /// Is this a serialization conflict?
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
