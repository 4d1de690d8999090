//! Key records and the operations over the `api_keys` table.

use crate::KeyStoreError;
use chrono::{DateTime, Utc};
use pylon_types::{CapOverrides, Priority};
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Number of random characters after the `sk-` prefix.
const CREDENTIAL_TOKEN_LEN: usize = 32;

/// Characters of the credential kept as the display prefix (`sk-` + 5).
const PREFIX_LEN: usize = 8;

/// A stored API key record. The plaintext credential is never part of this
/// struct.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiKey {
    pub id: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub key_prefix: String,
    pub description: String,
    pub priority: Priority,
    pub created_at: String,
    pub expires_at: Option<String>,
    pub revoked_at: Option<String>,
    /// Per-key cap overrides; `None` fields use the policy default.
    #[serde(flatten)]
    pub overrides: CapOverrides,
}

impl ApiKey {
    /// Whether the expiry timestamp (if any) lies at or before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> Result<bool, KeyStoreError> {
        match &self.expires_at {
            None => Ok(false),
            Some(raw) => {
                let expires = DateTime::parse_from_rfc3339(raw).map_err(|_| {
                    KeyStoreError::MalformedTimestamp {
                        id: self.id.clone(),
                        value: raw.clone(),
                    }
                })?;
                Ok(expires <= now)
            }
        }
    }
}

fn read_key_row(row: &Row<'_>) -> rusqlite::Result<RawKey> {
    Ok(RawKey {
        id: row.get(0)?,
        key_hash: row.get(1)?,
        key_prefix: row.get(2)?,
        description: row.get(3)?,
        priority: row.get(4)?,
        created_at: row.get(5)?,
        expires_at: row.get(6)?,
        revoked_at: row.get(7)?,
        max_rpm: row.get(8)?,
        max_concurrent: row.get(9)?,
        max_sse: row.get(10)?,
    })
}

/// Intermediate row shape; converted into [`ApiKey`] after parsing priority.
struct RawKey {
    id: String,
    key_hash: String,
    key_prefix: String,
    description: String,
    priority: String,
    created_at: String,
    expires_at: Option<String>,
    revoked_at: Option<String>,
    max_rpm: Option<u32>,
    max_concurrent: Option<u32>,
    max_sse: Option<u32>,
}

impl RawKey {
    fn into_key(self) -> Result<ApiKey, KeyStoreError> {
        let priority =
            self.priority
                .parse::<Priority>()
                .map_err(|_| KeyStoreError::MalformedPriority {
                    id: self.id.clone(),
                    value: self.priority.clone(),
                })?;
        Ok(ApiKey {
            id: self.id,
            key_hash: self.key_hash,
            key_prefix: self.key_prefix,
            description: self.description,
            priority,
            created_at: self.created_at,
            expires_at: self.expires_at,
            revoked_at: self.revoked_at,
            overrides: CapOverrides {
                max_rpm: self.max_rpm,
                max_concurrent: self.max_concurrent,
                max_sse: self.max_sse,
            },
        })
    }
}

const SELECT_COLUMNS: &str = "id, key_hash, key_prefix, description, priority, created_at, \
     expires_at, revoked_at, max_rpm, max_concurrent, max_sse";

/// Outcome of resolving a presented credential.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The credential maps to a live key.
    Active(ApiKey),
    /// No key with this hash exists.
    NotFound,
    /// The key's expiry timestamp has passed.
    Expired,
    /// The key was revoked by an admin.
    Revoked,
}

/// Mutable fields for [`update_key`]. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct KeyPatch {
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub overrides: Option<CapOverrides>,
}

/// Hex SHA-256 of the full presented credential.
pub fn hash_credential(presented: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(presented.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generates a fresh credential from the OS entropy source.
fn generate_credential() -> String {
    let token: String = OsRng
        .sample_iter(&Alphanumeric)
        .take(CREDENTIAL_TOKEN_LEN)
        .map(char::from)
        .collect();
    format!("sk-{token}")
}

/// Creates a new key and returns the record together with the plaintext
/// credential. The plaintext is not recoverable afterwards.
pub fn create_key(
    conn: &Connection,
    description: &str,
    priority: Priority,
    ttl_days: Option<i64>,
    overrides: CapOverrides,
) -> Result<(ApiKey, String), KeyStoreError> {
    let credential = generate_credential();
    let now = Utc::now();
    let expires_at = ttl_days.map(|days| (now + chrono::Duration::days(days)).to_rfc3339());

    let key = ApiKey {
        id: uuid::Uuid::new_v4().to_string(),
        key_hash: hash_credential(&credential),
        key_prefix: credential[..PREFIX_LEN].to_string(),
        description: description.to_string(),
        priority,
        created_at: now.to_rfc3339(),
        expires_at,
        revoked_at: None,
        overrides,
    };

    conn.execute(
        "INSERT INTO api_keys
            (id, key_hash, key_prefix, description, priority, created_at,
             expires_at, revoked_at, max_rpm, max_concurrent, max_sse)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, ?9, ?10)",
        params![
            key.id,
            key.key_hash,
            key.key_prefix,
            key.description,
            key.priority.as_str(),
            key.created_at,
            key.expires_at,
            key.overrides.max_rpm,
            key.overrides.max_concurrent,
            key.overrides.max_sse,
        ],
    )?;

    tracing::info!(key_id = %key.id, prefix = %key.key_prefix, "created api key");

    Ok((key, credential))
}

/// Resolves a presented credential to a key record.
///
/// Revocation takes precedence over expiry when both apply.
pub fn resolve_key(
    conn: &Connection,
    presented: &str,
    now: DateTime<Utc>,
) -> Result<Resolution, KeyStoreError> {
    let hash = hash_credential(presented);
    let raw = conn
        .query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM api_keys WHERE key_hash = ?1"),
            params![hash],
            read_key_row,
        )
        .optional()?;

    let Some(raw) = raw else {
        return Ok(Resolution::NotFound);
    };
    let key = raw.into_key()?;

    if key.revoked_at.is_some() {
        return Ok(Resolution::Revoked);
    }
    if key.is_expired(now)? {
        return Ok(Resolution::Expired);
    }
    Ok(Resolution::Active(key))
}

/// Fetches a key by id.
pub fn get_key(conn: &Connection, id: &str) -> Result<ApiKey, KeyStoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM api_keys WHERE id = ?1"),
            params![id],
            read_key_row,
        )
        .optional()?;
    raw.ok_or_else(|| KeyStoreError::NotFound(id.to_string()))?
        .into_key()
}

/// Lists all keys, newest first.
pub fn list_keys(conn: &Connection) -> Result<Vec<ApiKey>, KeyStoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM api_keys ORDER BY created_at DESC"
    ))?;
    let rows = stmt.query_map([], read_key_row)?;

    let mut keys = Vec::new();
    for row in rows {
        keys.push(row?.into_key()?);
    }
    Ok(keys)
}

/// Replaces the stored hash and prefix with a freshly generated credential,
/// returning the updated record and the new plaintext. The previous
/// credential stops resolving the moment the UPDATE commits.
pub fn refresh_key(conn: &Connection, id: &str) -> Result<(ApiKey, String), KeyStoreError> {
    let credential = generate_credential();
    let hash = hash_credential(&credential);
    let prefix = &credential[..PREFIX_LEN];

    let changed = conn.execute(
        "UPDATE api_keys SET key_hash = ?1, key_prefix = ?2 WHERE id = ?3",
        params![hash, prefix, id],
    )?;
    if changed == 0 {
        return Err(KeyStoreError::NotFound(id.to_string()));
    }

    tracing::info!(key_id = %id, prefix = %prefix, "refreshed api key credential");

    let key = get_key(conn, id)?;
    Ok((key, credential))
}

/// Marks a key revoked. Idempotent: revoking twice keeps the first timestamp.
pub fn revoke_key(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<(), KeyStoreError> {
    let changed = conn.execute(
        "UPDATE api_keys SET revoked_at = COALESCE(revoked_at, ?1) WHERE id = ?2",
        params![now.to_rfc3339(), id],
    )?;
    if changed == 0 {
        return Err(KeyStoreError::NotFound(id.to_string()));
    }
    tracing::info!(key_id = %id, "revoked api key");
    Ok(())
}

/// Applies a partial update to description, priority, or cap overrides.
pub fn update_key(conn: &Connection, id: &str, patch: KeyPatch) -> Result<ApiKey, KeyStoreError> {
    let existing = get_key(conn, id)?;

    let description = patch.description.unwrap_or(existing.description);
    let priority = patch.priority.unwrap_or(existing.priority);
    let overrides = patch.overrides.unwrap_or(existing.overrides);

    conn.execute(
        "UPDATE api_keys
         SET description = ?1, priority = ?2, max_rpm = ?3, max_concurrent = ?4, max_sse = ?5
         WHERE id = ?6",
        params![
            description,
            priority.as_str(),
            overrides.max_rpm,
            overrides.max_concurrent,
            overrides.max_sse,
            id,
        ],
    )?;

    get_key(conn, id)
}

/// Deletes a key that is revoked or expired. Active keys are refused.
pub fn delete_key(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<(), KeyStoreError> {
    let key = get_key(conn, id)?;
    if key.revoked_at.is_none() && !key.is_expired(now)? {
        return Err(KeyStoreError::StillActive(id.to_string()));
    }

    conn.execute("DELETE FROM api_keys WHERE id = ?1", params![id])?;
    tracing::info!(key_id = %id, "deleted api key");
    Ok(())
}
