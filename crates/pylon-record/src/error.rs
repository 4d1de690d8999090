//! Recorder error type.

use thiserror::Error;

/// Errors from recorder persistence and statistics queries.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The underlying SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No pooled connection was available.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}
