//! Key store error type.

use thiserror::Error;

/// Errors produced by key store operations.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// No key with the given id exists.
    #[error("key not found: {0}")]
    NotFound(String),

    /// The key is neither revoked nor expired and cannot be deleted.
    #[error("key {0} is still active; revoke it first")]
    StillActive(String),

    /// A stored timestamp failed to parse.
    #[error("malformed timestamp in key record {id}: {value}")]
    MalformedTimestamp { id: String, value: String },

    /// A stored priority label was not recognized.
    #[error("malformed priority in key record {id}: {value}")]
    MalformedPriority { id: String, value: String },

    /// The underlying SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}
