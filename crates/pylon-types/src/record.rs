//! Per-request completion records.

use serde::{Deserialize, Serialize};

/// Everything the recorder persists about one finished request.
///
/// Exactly one record is produced per accepted request, on every exit path:
/// success, rejection, downstream failure, client disconnect (status 499),
/// or stream termination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionRecord {
    /// Identity that issued the request; empty for unauthenticated rejects.
    pub key_id: String,
    /// API identifier: a matched pattern or the literal "METHOD /path".
    pub api: String,
    /// HTTP status answered to the client (499 for client disconnect).
    pub status: u16,
    /// Wall-clock start, RFC 3339.
    pub started_at: String,
    /// Total request duration in milliseconds.
    pub duration_ms: i64,
    /// Remote peer address.
    pub client_addr: String,
    /// Whether the response was streamed as SSE.
    pub is_sse: bool,
    /// Number of SSE messages forwarded (0 for unary).
    pub sse_message_count: u64,
    /// Whether the request was refused by an admission cap.
    pub rate_limited: bool,
}
