//! Embedded schema migrations.
//!
//! The schema is an ordered sequence of SQL steps compiled into the binary.
//! SQLite's `user_version` header field records how many steps a database
//! has already applied; startup runs the remainder, each step inside its
//! own transaction together with the version bump, so a half-applied step
//! never advances the version.

use rusqlite::Connection;
use thiserror::Error;

/// One schema step. Its position in [`SCHEMA_STEPS`] is its version.
struct SchemaStep {
    name: &'static str,
    sql: &'static str,
}

/// All schema steps in order. Append-only: published steps never change.
const SCHEMA_STEPS: &[SchemaStep] = &[
    SchemaStep {
        name: "api_keys",
        sql: include_str!("migrations/000_api_keys.sql"),
    },
    SchemaStep {
        name: "request_log",
        sql: include_str!("migrations/001_request_log.sql"),
    },
    SchemaStep {
        name: "policy",
        sql: include_str!("migrations/002_policy.sql"),
    },
];

/// Errors that can occur while bringing the schema up to date.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A schema step could not be applied; the transaction rolled back and
    /// the recorded version still points at the previous step.
    #[error("schema step '{name}' (version {version}) failed: {source}")]
    StepFailed {
        name: &'static str,
        version: usize,
        #[source]
        source: rusqlite::Error,
    },

    /// The stored `user_version` could not be read.
    #[error("failed to read schema version: {0}")]
    VersionRead(#[source] rusqlite::Error),

    /// The database was written by a newer build.
    #[error("database schema version {found} is newer than this build supports ({supported})")]
    SchemaTooNew { found: i64, supported: usize },
}

/// Applies all schema steps the database has not seen yet.
///
/// Returns the number of steps applied (0 when the schema is current).
///
/// # Errors
///
/// Returns [`MigrationError::SchemaTooNew`] when the database reports a
/// version beyond this build's step list, and [`MigrationError::StepFailed`]
/// when a step's SQL fails; in that case nothing of the failing step
/// persists.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    apply_steps(conn, SCHEMA_STEPS)
}

fn apply_steps(conn: &Connection, steps: &[SchemaStep]) -> Result<usize, MigrationError> {
    let recorded: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(MigrationError::VersionRead)?;

    // A tampered negative version reads as zero; re-running step one against
    // existing tables then fails loudly rather than silently skipping.
    let done = usize::try_from(recorded).unwrap_or(0);
    if done > steps.len() {
        return Err(MigrationError::SchemaTooNew {
            found: recorded,
            supported: steps.len(),
        });
    }

    for (index, step) in steps.iter().enumerate().skip(done) {
        let version = index + 1;
        let fail = |source| MigrationError::StepFailed {
            name: step.name,
            version,
            source,
        };

        tracing::info!(step = step.name, version, "applying schema step");

        let tx = conn.unchecked_transaction().map_err(fail)?;
        tx.execute_batch(step.sql).map_err(fail)?;
        tx.pragma_update(None, "user_version", version as i64)
            .map_err(fail)?;
        tx.commit().map_err(fail)?;
    }

    Ok(steps.len() - done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn schema_version(conn: &Connection) -> i64 {
        conn.query_row("PRAGMA user_version", [], |row| row.get(0))
            .expect("should read user_version")
    }

    #[test]
    fn fresh_db_applies_every_step() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let applied = run_migrations(&conn).expect("migrations should succeed");

        assert_eq!(applied, SCHEMA_STEPS.len());
        assert_eq!(schema_version(&conn), SCHEMA_STEPS.len() as i64);
    }

    #[test]
    fn current_db_applies_nothing() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");

        run_migrations(&conn).expect("first run should succeed");
        let second = run_migrations(&conn).expect("second run should succeed");

        assert_eq!(second, 0, "no new steps to apply");
        assert_eq!(schema_version(&conn), SCHEMA_STEPS.len() as i64);
    }

    #[test]
    fn partially_migrated_db_resumes_where_it_stopped() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");

        let first = apply_steps(&conn, &SCHEMA_STEPS[..1]).expect("prefix should apply");
        assert_eq!(first, 1);
        assert_eq!(schema_version(&conn), 1);

        let rest = run_migrations(&conn).expect("remaining steps should apply");
        assert_eq!(rest, SCHEMA_STEPS.len() - 1);
        assert_eq!(schema_version(&conn), SCHEMA_STEPS.len() as i64);
    }

    #[test]
    fn core_tables_exist_after_migrations() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        run_migrations(&conn).expect("migrations should succeed");

        for table in ["api_keys", "request_log", "policy"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .expect("should query sqlite_master");
            assert_eq!(count, 1, "table {table} should exist");
        }
    }

    #[test]
    fn db_from_a_newer_build_is_refused() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        conn.pragma_update(None, "user_version", 99)
            .expect("should set user_version");

        let err = run_migrations(&conn).expect_err("future schema should be refused");
        match err {
            MigrationError::SchemaTooNew { found, supported } => {
                assert_eq!(found, 99);
                assert_eq!(supported, SCHEMA_STEPS.len());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn failing_step_leaves_no_trace() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let steps = [SchemaStep {
            name: "broken",
            sql: "
                CREATE TABLE rollback_probe (id INTEGER PRIMARY KEY);
                INSERT INTO no_such_table VALUES (1);
            ",
        }];

        let err = apply_steps(&conn, &steps).expect_err("broken step should fail");
        match err {
            MigrationError::StepFailed { name, version, .. } => {
                assert_eq!(name, "broken");
                assert_eq!(version, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let exists: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM sqlite_master WHERE name = 'rollback_probe'",
                [],
                |row| row.get(0),
            )
            .expect("should query sqlite_master");
        assert!(!exists, "failed step should leave no side effects");
        assert_eq!(schema_version(&conn), 0, "version must not advance");
    }
}
