//! The proxy engine.
//!
//! Admitted requests are forwarded to the downstream with method, path,
//! query, headers (minus hop-by-hop), and body preserved. Responses branch
//! on content type: unary bodies are streamed straight through; SSE
//! responses are relayed frame by frame with per-message rate accounting,
//! an idle deadline, and in-band `pylon_error` termination events.
//!
//! Each relay runs in its own task that owns the admission ticket, so every
//! exit path — completion, downstream failure, idle timeout, rate breach,
//! client disconnect — releases the slot and emits exactly one completion
//! record.

use crate::auth::AuthError;
use crate::AppState;
use axum::body::Body;
use axum::extract::{ConnectInfo, Extension};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use pylon_gate::{api_identifier, AdmissionOutcome, Ticket};
use pylon_types::{CompletionRecord, PolicySnapshot, RejectReason};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Headers that must not cross the proxy, per RFC 9110 §7.6.1, plus the
/// message-framing headers the client re-derives.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Relay channel depth; bounds buffering between downstream and client.
const RELAY_CHANNEL_CAPACITY: usize = 16;

/// Status recorded when the client went away before the response finished.
const STATUS_CLIENT_CLOSED: u16 = 499;

/// Per-request bookkeeping threaded through the proxy path.
#[derive(Debug, Clone)]
pub(crate) struct RequestContext {
    pub key_id: String,
    pub api: String,
    pub client_addr: String,
    pub started_wall: DateTime<Utc>,
    pub started: Instant,
}

/// Builds the JSON rejection response for a reason code.
pub(crate) fn reject_response(reason: RejectReason) -> Response {
    let status =
        StatusCode::from_u16(reason.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(serde_json::json!({
            "code": reason.code(),
            "message": reason.message(),
        })),
    )
        .into_response()
}

/// Emits the completion record for one finished request.
fn finish(
    state: &AppState,
    ctx: &RequestContext,
    status: u16,
    is_sse: bool,
    sse_message_count: u64,
    rate_limited: bool,
) {
    state.recorder.record(CompletionRecord {
        key_id: ctx.key_id.clone(),
        api: ctx.api.clone(),
        status,
        started_at: ctx.started_wall.to_rfc3339(),
        duration_ms: ctx.started.elapsed().as_millis() as i64,
        client_addr: ctx.client_addr.clone(),
        is_sse,
        sse_message_count,
        rate_limited,
    });
}

/// Handler behind every non-`/health` route on the proxy port.
pub async fn proxy_handler(
    Extension(state): Extension<Arc<AppState>>,
    req: Request<Body>,
) -> Response {
    let started_wall = Utc::now();
    let started = Instant::now();
    let snapshot = state.gate.current_policy();
    let client_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();

    let api = api_identifier(
        req.method().as_str(),
        req.uri().path(),
        &snapshot.api_limits,
    );

    let key = match crate::auth::authenticate(&state, req.headers()).await {
        Ok(key) => key,
        Err(err) => {
            let status = match err {
                AuthError::Internal => 500,
                _ => 401,
            };
            finish(
                &state,
                &RequestContext {
                    key_id: String::new(),
                    api,
                    client_addr,
                    started_wall,
                    started,
                },
                status,
                false,
                0,
                false,
            );
            return err.into_response();
        }
    };

    let is_sse_hint = req
        .headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"));

    let ctx = RequestContext {
        key_id: key.id.clone(),
        api: api.clone(),
        client_addr,
        started_wall,
        started,
    };

    match state
        .gate
        .admit(
            &key.id,
            key.overrides,
            key.priority,
            &api,
            is_sse_hint,
            &snapshot,
        )
        .await
    {
        AdmissionOutcome::Admitted(ticket) => {
            forward(state.clone(), snapshot, ticket, req, ctx).await
        }
        AdmissionOutcome::Rejected(reason) => {
            finish(
                &state,
                &ctx,
                reason.status(),
                false,
                0,
                reason.is_rate_limited(),
            );
            reject_response(reason)
        }
    }
}

/// Forwards one admitted request and relays the response.
async fn forward(
    state: Arc<AppState>,
    snapshot: Arc<PolicySnapshot>,
    ticket: Ticket,
    req: Request<Body>,
    ctx: RequestContext,
) -> Response {
    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!(
        "{}{}",
        snapshot.downstream.base_url.trim_end_matches('/'),
        path_and_query
    );

    let request = state
        .http
        .request(parts.method, &url)
        .headers(strip_request_headers(&parts.headers))
        .body(reqwest::Body::wrap_stream(body.into_data_stream()));

    // Bounds connection + response headers. The unary body deadline
    // continues from this; SSE streaming is governed by the idle timeout.
    let connect_deadline = Duration::from_secs(snapshot.downstream.timeout_secs);
    let response = match tokio::time::timeout(connect_deadline, request.send()).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, url = %url, "downstream request failed");
            ticket.release();
            finish(&state, &ctx, 502, false, 0, false);
            return reject_response(RejectReason::DownstreamError);
        }
        Err(_) => {
            tracing::warn!(url = %url, "downstream did not answer within the deadline");
            ticket.release();
            finish(&state, &ctx, 502, false, 0, false);
            return reject_response(RejectReason::DownstreamError);
        }
    };

    let is_event_stream = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));

    if is_event_stream {
        sse_relay(state, snapshot, ticket, response, ctx)
    } else {
        unary_relay(state, snapshot, ticket, response, ctx)
    }
}

/// Streams a unary response body through to the client.
fn unary_relay(
    state: Arc<AppState>,
    snapshot: Arc<PolicySnapshot>,
    ticket: Ticket,
    response: reqwest::Response,
    ctx: RequestContext,
) -> Response {
    let status = response.status();
    let headers = strip_response_headers(response.headers());

    let overall = Duration::from_secs(snapshot.downstream.timeout_secs);
    let remaining = overall.saturating_sub(ctx.started.elapsed());

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(RELAY_CHANNEL_CAPACITY);
    tokio::spawn(run_unary_relay(state, ticket, response, ctx, tx, remaining));

    build_response(status, headers, Body::from_stream(ReceiverStream::new(rx)))
}

async fn run_unary_relay(
    state: Arc<AppState>,
    ticket: Ticket,
    response: reqwest::Response,
    ctx: RequestContext,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    deadline: Duration,
) {
    let mut final_status = response.status().as_u16();
    let mut stream = response.bytes_stream();
    let deadline_at = tokio::time::Instant::now() + deadline;

    loop {
        match tokio::time::timeout_at(deadline_at, stream.next()).await {
            // Downstream finished cleanly.
            Ok(None) => break,
            Ok(Some(Ok(chunk))) => {
                if tx.send(Ok(chunk)).await.is_err() {
                    final_status = STATUS_CLIENT_CLOSED;
                    break;
                }
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(error = %e, api = %ctx.api, "downstream body failed mid-response");
                // Abort the client connection rather than ending the body
                // as if it were complete.
                let _ = tx
                    .send(Err(std::io::Error::other("downstream body failed")))
                    .await;
                final_status = 502;
                break;
            }
            Err(_) => {
                tracing::warn!(api = %ctx.api, "downstream body exceeded the request deadline");
                let _ = tx
                    .send(Err(std::io::Error::other("downstream deadline exceeded")))
                    .await;
                final_status = 502;
                break;
            }
        }
    }

    drop(tx);
    ticket.release();
    finish(&state, &ctx, final_status, false, 0, false);
}

/// Relays an SSE response frame by frame.
fn sse_relay(
    state: Arc<AppState>,
    snapshot: Arc<PolicySnapshot>,
    mut ticket: Ticket,
    response: reqwest::Response,
    ctx: RequestContext,
) -> Response {
    // The downstream answered with an event stream regardless of what the
    // client asked for; the held slot must be the SSE kind.
    if !ticket.is_sse() {
        ticket.convert_to_sse();
    }

    let status = response.status();
    let headers = strip_response_headers(response.headers());
    let idle = Duration::from_secs(snapshot.sse.idle_timeout_secs);

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(RELAY_CHANNEL_CAPACITY);
    tokio::spawn(run_sse_relay(state, ticket, response, ctx, tx, idle));

    build_response(status, headers, Body::from_stream(ReceiverStream::new(rx)))
}

async fn run_sse_relay(
    state: Arc<AppState>,
    ticket: Ticket,
    response: reqwest::Response,
    ctx: RequestContext,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    idle: Duration,
) {
    let status = response.status().as_u16();
    let mut stream = response.bytes_stream();
    let mut buffer = BytesMut::new();
    let mut messages: u64 = 0;
    let mut rate_limited = false;

    'relay: loop {
        match tokio::time::timeout(idle, stream.next()).await {
            // No byte from the downstream within the idle window.
            Err(_) => {
                tracing::debug!(api = %ctx.api, "sse stream idle past the deadline");
                let frame =
                    termination_frame("idle_timeout", "no data received within the idle timeout");
                let _ = tx.send(Ok(frame)).await;
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::warn!(error = %e, api = %ctx.api, "sse stream failed mid-stream");
                let frame = termination_frame("downstream_error", "downstream stream failed");
                let _ = tx.send(Ok(frame)).await;
                break;
            }
            Ok(Some(Ok(chunk))) => {
                buffer.extend_from_slice(&chunk);
                while let Some(frame_end) = find_frame_end(&buffer) {
                    let frame = buffer.split_to(frame_end).freeze();
                    if frame_carries_data(&frame) {
                        if !ticket.record_message() {
                            tracing::debug!(
                                key_id = %ctx.key_id,
                                api = %ctx.api,
                                forwarded = messages,
                                "sse message rate cap reached, terminating stream"
                            );
                            let frame = termination_frame(
                                "rate_limit_exceeded",
                                "message rate limit exceeded",
                            );
                            let _ = tx.send(Ok(frame)).await;
                            rate_limited = true;
                            break 'relay;
                        }
                        messages += 1;
                    }
                    if tx.send(Ok(frame)).await.is_err() {
                        // Client went away; nothing left to forward.
                        break 'relay;
                    }
                }
            }
        }
    }

    drop(tx);
    ticket.release();
    finish(&state, &ctx, status, true, messages, rate_limited);
}

/// The in-band termination event. Wire format is fixed:
/// `event: pylon_error\ndata: {"code":"<code>","message":"<text>"}\n\n`.
fn termination_frame(code: &str, message: &str) -> Bytes {
    let data = serde_json::json!({ "code": code, "message": message });
    Bytes::from(format!("event: pylon_error\ndata: {data}\n\n"))
}

/// Finds the end (exclusive, including the delimiter) of the first complete
/// SSE frame in `buffer`, delimited by a blank line.
fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < buffer.len() {
        if buffer[i] == b'\n' {
            if buffer.get(i + 1) == Some(&b'\n') {
                return Some(i + 2);
            }
            if buffer.get(i + 1) == Some(&b'\r') && buffer.get(i + 2) == Some(&b'\n') {
                return Some(i + 3);
            }
        }
        i += 1;
    }
    None
}

/// Whether a frame contains a `data` field (comment-only and retry-only
/// frames do not count as messages).
fn frame_carries_data(frame: &[u8]) -> bool {
    frame.split(|&b| b == b'\n').any(|line| {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        line == b"data" || line.starts_with(b"data:")
    })
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Removes hop-by-hop and host/framing headers before forwarding a request.
fn strip_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in HOP_BY_HOP {
        out.remove(*name);
    }
    // The client re-derives these for the downstream connection.
    out.remove(header::HOST);
    out.remove(header::CONTENT_LENGTH);
    out
}

/// Removes hop-by-hop and framing headers before answering the client.
fn strip_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in HOP_BY_HOP {
        out.remove(*name);
    }
    out.remove(header::CONTENT_LENGTH);
    out
}
