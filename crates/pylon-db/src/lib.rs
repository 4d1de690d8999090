//! SQLite persistence for the Pylon proxy.
//!
//! One pooled database holds the three Pylon tables: `api_keys` (the key
//! store), `request_log` (append-only completion records), and `policy`
//! (a single-row JSON document). The proxy hot path only ever reads keys;
//! writes come from the admin surface and the recorder's flush worker,
//! which WAL journaling lets proceed without blocking those reads.
//!
//! Schema management is versioned through SQLite's `user_version` header:
//! the ordered SQL steps under `src/migrations/` are compiled in via
//! `include_str!` and applied transactionally at startup — see
//! [`run_migrations`]. Pool behavior (size, busy timeout) is driven by the
//! server's `database.*` configuration through [`PoolSettings`].

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, PoolError, PoolSettings};
