//! SQLite connection pooling.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;
use thiserror::Error;

/// A type alias for the SQLite connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Tunables applied to every pooled connection.
///
/// Both values come from the server's static configuration
/// (`database.busy_timeout_ms`, `database.max_connections`).
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    /// How long a connection waits on a locked database before failing the
    /// statement, in milliseconds.
    pub busy_timeout_ms: u64,
    /// Upper bound on pooled connections. Key lookups on the proxy path,
    /// admin queries, and the recorder's flush worker all draw from the
    /// same pool.
    pub max_connections: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            max_connections: 8,
        }
    }
}

/// Errors that can occur when creating the database pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool could not be built for the given database path.
    #[error("failed to open connection pool for '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: r2d2::Error,
    },
}

/// Creates the SQLite connection pool.
///
/// Every connection is initialized with WAL journaling (key lookups keep
/// reading while the recorder flushes), `synchronous = NORMAL` (sufficient
/// durability for an append-mostly request log under WAL), foreign keys on,
/// and the configured busy timeout.
///
/// # Arguments
///
/// * `db_path` - Path to the SQLite database file. Use `:memory:` for an
///   in-memory database (useful for testing).
/// * `settings` - Runtime tunables, normally from `database.*` config.
///
/// # Errors
///
/// Returns [`PoolError::Open`] if the connection pool cannot be created.
pub fn create_pool(db_path: &str, settings: PoolSettings) -> Result<DbPool, PoolError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    let busy_timeout_ms = settings.busy_timeout_ms;
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(flags)
        .with_init(move |conn| {
            conn.execute_batch(&format!(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = {busy_timeout_ms};"
            ))
        });

    Pool::builder()
        .max_size(settings.max_connections)
        .build(manager)
        .map_err(|source| PoolError::Open {
            path: db_path.to_string(),
            source,
        })
}
