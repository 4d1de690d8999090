//! Admin API handlers.
//!
//! Everything here is a collaborator of the admission core: key lifecycle,
//! policy read/update with hot reload, the monitor snapshot, and request
//! statistics. The surface is bearer-token protected; the token comes from
//! `POST /admin/login`.

use crate::{AppState, token::AdminTokens};
use axum::{
    body::Body,
    extract::{Extension, Json, Path, Query},
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use pylon_keys::{ApiKey, KeyPatch, KeyStoreError};
use pylon_types::{CapOverrides, PolicySnapshot, Priority};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

/// Errors answered by the admin surface.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<KeyStoreError> for ApiError {
    fn from(err: KeyStoreError) -> Self {
        match err {
            KeyStoreError::NotFound(id) => ApiError::NotFound(format!("key not found: {id}")),
            KeyStoreError::StillActive(id) => {
                ApiError::Conflict(format!("key {id} is still active; revoke it first"))
            }
            other => ApiError::InternalServerError(other.to_string()),
        }
    }
}

/// Runs a blocking key-store closure on the blocking pool.
async fn with_conn<T, F>(state: &Arc<AppState>, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&rusqlite::Connection) -> Result<T, ApiError> + Send + 'static,
{
    let pool = state.pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| ApiError::InternalServerError(format!("db connection failed: {e}")))?;
        f(&conn)
    })
    .await
    .map_err(|e| ApiError::InternalServerError(format!("task join error: {e}")))?
}

// ── Login ────────────────────────────────────────────────────────────────

/// Request body for `POST /admin/login`.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

/// Response body for a successful login.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: String,
}

/// Handler for `POST /admin/login`.
///
/// Compares the SHA-256 of the submitted password against the configured
/// hash and issues a signed bearer token on success.
pub async fn login_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    if state.admin_password_sha256.is_empty() {
        return Err(ApiError::Unauthorized("admin login is disabled".to_string()));
    }

    let submitted = hex::encode(Sha256::digest(payload.password.as_bytes()));
    if submitted != state.admin_password_sha256.to_ascii_lowercase() {
        tracing::warn!("failed admin login attempt");
        return Err(ApiError::Unauthorized("invalid password".to_string()));
    }

    let (token, expires_at) = state.tokens.issue(Utc::now());
    Ok(Json(LoginResponse {
        token,
        expires_at: expires_at.to_rfc3339(),
    }))
}

/// Middleware guarding every admin route except login.
pub async fn admin_auth_middleware(req: Request<Body>, next: Next) -> Response {
    let Some(state) = req.extensions().get::<Arc<AppState>>().cloned() else {
        return ApiError::InternalServerError("missing application state".to_string())
            .into_response();
    };

    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match token {
        Some(token) if verify(&state.tokens, token) => next.run(req).await,
        _ => ApiError::Unauthorized("missing or invalid admin token".to_string()).into_response(),
    }
}

fn verify(tokens: &AdminTokens, token: &str) -> bool {
    tokens.verify(token, Utc::now())
}

// ── Key lifecycle ────────────────────────────────────────────────────────

/// Request body for `POST /admin/keys`.
#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    /// Days until expiry; omit for a non-expiring key.
    pub ttl_days: Option<i64>,
    pub max_rpm: Option<u32>,
    pub max_concurrent: Option<u32>,
    pub max_sse: Option<u32>,
}

/// Response carrying the plaintext credential — returned exactly once.
#[derive(Debug, Serialize)]
pub struct CredentialResponse {
    pub credential: String,
    #[serde(flatten)]
    pub key: ApiKey,
}

/// Handler for `GET /admin/keys`.
pub async fn list_keys_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<ApiKey>>, ApiError> {
    let keys = with_conn(&state, |conn| Ok(pylon_keys::list_keys(conn)?)).await?;
    Ok(Json(keys))
}

/// Handler for `POST /admin/keys`.
pub async fn create_key_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<CredentialResponse>), ApiError> {
    if let Some(days) = payload.ttl_days {
        if days <= 0 {
            return Err(ApiError::BadRequest("ttl_days must be positive".to_string()));
        }
    }

    let overrides = CapOverrides {
        max_rpm: payload.max_rpm,
        max_concurrent: payload.max_concurrent,
        max_sse: payload.max_sse,
    };
    let (key, credential) = with_conn(&state, move |conn| {
        Ok(pylon_keys::create_key(
            conn,
            &payload.description,
            payload.priority,
            payload.ttl_days,
            overrides,
        )?)
    })
    .await?;

    Ok((StatusCode::CREATED, Json(CredentialResponse { credential, key })))
}

/// Handler for `GET /admin/keys/{id}`.
pub async fn get_key_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiKey>, ApiError> {
    let key = with_conn(&state, move |conn| Ok(pylon_keys::get_key(conn, &id)?)).await?;
    Ok(Json(key))
}

/// Request body for `PATCH /admin/keys/{id}`.
///
/// Providing any of the cap fields replaces the key's override set as a
/// whole; omitted cap fields clear back to the policy default.
#[derive(Debug, Deserialize)]
pub struct UpdateKeyRequest {
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub max_rpm: Option<u32>,
    pub max_concurrent: Option<u32>,
    pub max_sse: Option<u32>,
}

/// Handler for `PATCH /admin/keys/{id}`.
pub async fn update_key_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateKeyRequest>,
) -> Result<Json<ApiKey>, ApiError> {
    let overrides = if payload.max_rpm.is_some()
        || payload.max_concurrent.is_some()
        || payload.max_sse.is_some()
    {
        Some(CapOverrides {
            max_rpm: payload.max_rpm,
            max_concurrent: payload.max_concurrent,
            max_sse: payload.max_sse,
        })
    } else {
        None
    };

    let patch = KeyPatch {
        description: payload.description,
        priority: payload.priority,
        overrides,
    };
    let key = with_conn(&state, move |conn| {
        Ok(pylon_keys::update_key(conn, &id, patch)?)
    })
    .await?;
    Ok(Json(key))
}

/// Handler for `POST /admin/keys/{id}/refresh`. Replaces the credential and
/// returns the new plaintext; the previous credential stops working at once.
pub async fn refresh_key_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CredentialResponse>, ApiError> {
    let (key, credential) = with_conn(&state, move |conn| {
        Ok(pylon_keys::refresh_key(conn, &id)?)
    })
    .await?;
    Ok(Json(CredentialResponse { credential, key }))
}

/// Handler for `POST /admin/keys/{id}/revoke`.
pub async fn revoke_key_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiKey>, ApiError> {
    let key = with_conn(&state, move |conn| {
        pylon_keys::revoke_key(conn, &id, Utc::now())?;
        Ok(pylon_keys::get_key(conn, &id)?)
    })
    .await?;
    Ok(Json(key))
}

/// Handler for `DELETE /admin/keys/{id}`. Only revoked or expired keys may
/// be deleted.
pub async fn delete_key_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    with_conn(&state, move |conn| {
        Ok(pylon_keys::delete_key(conn, &id, Utc::now())?)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Policy ───────────────────────────────────────────────────────────────

/// Handler for `GET /admin/policy`.
pub async fn get_policy_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<PolicySnapshot> {
    Json((*state.gate.current_policy()).clone())
}

/// Handler for `PUT /admin/policy`.
///
/// Validates, persists, then atomically installs the new snapshot.
/// Requests already in flight keep the snapshot they captured.
pub async fn update_policy_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(new_policy): Json<PolicySnapshot>,
) -> Result<Json<PolicySnapshot>, ApiError> {
    new_policy
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let to_store = new_policy.clone();
    with_conn(&state, move |conn| {
        crate::policy::save(conn, &to_store)
            .map_err(|e| ApiError::InternalServerError(format!("failed to persist policy: {e}")))
    })
    .await?;

    state.gate.install_policy(new_policy.clone());
    tracing::info!("policy updated via admin api");
    Ok(Json(new_policy))
}

// ── Monitoring & statistics ──────────────────────────────────────────────

/// Handler for `GET /admin/monitor`: live counters.
pub async fn monitor_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<serde_json::Value> {
    let bank = state.gate.bank_snapshot();
    Json(serde_json::json!({
        "queue_size": state.gate.queue_len(),
        "active_connections": state.gate.active_connections(),
        "dropped_records": state.recorder.dropped_records(),
        "counters": bank,
    }))
}

/// Query parameters for `GET /admin/stats`.
#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    /// RFC 3339 lower bound on `started_at`.
    pub since: Option<String>,
}

/// Handler for `GET /admin/stats`.
pub async fn stats_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<pylon_record::StatsSummary>, ApiError> {
    let summary = with_conn(&state, move |conn| {
        pylon_record::query_summary(conn, query.since.as_deref())
            .map_err(|e| ApiError::InternalServerError(e.to_string()))
    })
    .await?;
    Ok(Json(summary))
}

/// Query parameters for `GET /admin/requests`.
#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<i64>,
}

/// Handler for `GET /admin/requests`: the newest request-log rows.
pub async fn recent_requests_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<pylon_record::LoggedRequest>>, ApiError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let rows = with_conn(&state, move |conn| {
        pylon_record::query_recent(conn, limit)
            .map_err(|e| ApiError::InternalServerError(e.to_string()))
    })
    .await?;
    Ok(Json(rows))
}
