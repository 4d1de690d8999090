//! Policy persistence.
//!
//! The dynamic policy lives in the single-row `policy` table as one JSON
//! document. Startup loads it (seeding a default when the table is empty);
//! admin updates persist first, then install the new snapshot into the gate.

use pylon_types::PolicySnapshot;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

/// Errors from policy load/store.
#[derive(Debug, Error)]
pub enum PolicyStoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("stored policy is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Loads the stored policy, inserting and returning the default when none
/// has been persisted yet.
pub fn load_or_init(conn: &Connection) -> Result<PolicySnapshot, PolicyStoreError> {
    let stored: Option<String> = conn
        .query_row("SELECT policy_json FROM policy WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()?;

    match stored {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => {
            let policy = PolicySnapshot::default();
            save(conn, &policy)?;
            tracing::info!("no stored policy found, seeded default");
            Ok(policy)
        }
    }
}

/// Persists the policy, replacing any previous version.
pub fn save(conn: &Connection, policy: &PolicySnapshot) -> Result<(), PolicyStoreError> {
    let json = serde_json::to_string(policy)?;
    conn.execute(
        "INSERT INTO policy (id, policy_json, updated_at)
         VALUES (1, ?1, datetime('now'))
         ON CONFLICT(id) DO UPDATE SET
             policy_json = excluded.policy_json,
             updated_at = excluded.updated_at",
        params![json],
    )?;
    Ok(())
}
