//! Statistics queries and retention over the request log.
//!
//! Read by the admin surface only; the proxy path never queries this table.

use crate::RecordError;
use rusqlite::{params, Connection, Row};
use serde::Serialize;

/// One persisted request-log row.
#[derive(Debug, Clone, Serialize)]
pub struct LoggedRequest {
    pub id: i64,
    pub key_id: String,
    pub api: String,
    pub status: u16,
    pub started_at: String,
    pub duration_ms: i64,
    pub client_addr: String,
    pub is_sse: bool,
    pub sse_message_count: u64,
    pub rate_limited: bool,
}

impl LoggedRequest {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            key_id: row.get(1)?,
            api: row.get(2)?,
            status: row.get(3)?,
            started_at: row.get(4)?,
            duration_ms: row.get(5)?,
            client_addr: row.get(6)?,
            is_sse: row.get(7)?,
            sse_message_count: row.get(8)?,
            rate_limited: row.get(9)?,
        })
    }
}

/// Per-key request count within the queried range.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStat {
    pub key_id: String,
    pub requests: i64,
}

/// Aggregate statistics over the request log.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub total_requests: i64,
    pub success_2xx: i64,
    pub client_errors_4xx: i64,
    pub server_errors_5xx: i64,
    pub rate_limited: i64,
    pub sse_requests: i64,
    pub sse_messages: i64,
    pub avg_duration_ms: f64,
    pub by_key: Vec<KeyStat>,
}

/// Computes aggregate statistics, optionally restricted to rows at or after
/// `since` (RFC 3339).
pub fn query_summary(conn: &Connection, since: Option<&str>) -> Result<StatsSummary, RecordError> {
    let since = since.unwrap_or("");

    let (total_requests, success_2xx, client_errors_4xx, server_errors_5xx, rate_limited, sse_requests, sse_messages, avg_duration_ms) =
        conn.query_row(
            "SELECT
                COUNT(*),
                COALESCE(SUM(status BETWEEN 200 AND 299), 0),
                COALESCE(SUM(status BETWEEN 400 AND 499), 0),
                COALESCE(SUM(status BETWEEN 500 AND 599), 0),
                COALESCE(SUM(rate_limited), 0),
                COALESCE(SUM(is_sse), 0),
                COALESCE(SUM(sse_message_count), 0),
                COALESCE(AVG(duration_ms), 0.0)
             FROM request_log
             WHERE ?1 = '' OR started_at >= ?1",
            params![since],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, f64>(7)?,
                ))
            },
        )?;

    let mut stmt = conn.prepare(
        "SELECT key_id, COUNT(*) AS requests
         FROM request_log
         WHERE ?1 = '' OR started_at >= ?1
         GROUP BY key_id
         ORDER BY requests DESC, key_id ASC
         LIMIT 50",
    )?;
    let by_key = stmt
        .query_map(params![since], |row| {
            Ok(KeyStat {
                key_id: row.get(0)?,
                requests: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(StatsSummary {
        total_requests,
        success_2xx,
        client_errors_4xx,
        server_errors_5xx,
        rate_limited,
        sse_requests,
        sse_messages,
        avg_duration_ms,
        by_key,
    })
}

/// Returns the most recent rows, newest first.
pub fn query_recent(conn: &Connection, limit: i64) -> Result<Vec<LoggedRequest>, RecordError> {
    let mut stmt = conn.prepare(
        "SELECT id, key_id, api, status, started_at, duration_ms, client_addr,
                is_sse, sse_message_count, rate_limited
         FROM request_log
         ORDER BY id DESC
         LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit], LoggedRequest::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Deletes rows whose `started_at` lies strictly before `cutoff` (RFC 3339).
/// Returns the number of rows removed.
pub fn delete_before(conn: &Connection, cutoff: &str) -> Result<usize, RecordError> {
    let deleted = conn.execute(
        "DELETE FROM request_log WHERE started_at < ?1",
        params![cutoff],
    )?;
    Ok(deleted)
}
