//! Proxy-port authentication.
//!
//! Every proxied request carries `Authorization: Bearer sk-<token>`. The
//! credential is resolved against the key store; failures answer 401 with a
//! `{"detail": "<reason>"}` body, matching the proxy wire contract.

use crate::AppState;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use pylon_keys::{ApiKey, Resolution};
use std::sync::Arc;

/// Why authentication failed; doubles as the 401 response body detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    MissingCredential,
    MalformedHeader,
    UnknownKey,
    ExpiredKey,
    RevokedKey,
    Internal,
}

impl AuthError {
    pub fn detail(self) -> &'static str {
        match self {
            Self::MissingCredential => "missing API key",
            Self::MalformedHeader => "malformed authorization header",
            Self::UnknownKey => "invalid API key",
            Self::ExpiredKey => "API key expired",
            Self::RevokedKey => "API key revoked",
            Self::Internal => "authentication unavailable",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        };
        (status, Json(serde_json::json!({ "detail": self.detail() }))).into_response()
    }
}

/// Extracts and resolves the bearer credential from request headers.
///
/// Key lookup is a blocking SQLite read, so it runs on the blocking pool.
pub async fn authenticate(state: &Arc<AppState>, headers: &HeaderMap) -> Result<ApiKey, AuthError> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(AuthError::MissingCredential)?;
    let value = header.to_str().map_err(|_| AuthError::MalformedHeader)?;
    let credential = value
        .strip_prefix("Bearer ")
        .ok_or(AuthError::MalformedHeader)?
        .trim()
        .to_string();
    if credential.is_empty() {
        return Err(AuthError::MissingCredential);
    }

    let pool = state.pool.clone();
    let resolution = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|e| {
            tracing::error!(error = %e, "no database connection for key lookup");
            AuthError::Internal
        })?;
        pylon_keys::resolve_key(&conn, &credential, Utc::now()).map_err(|e| {
            tracing::error!(error = %e, "key resolution failed");
            AuthError::Internal
        })
    })
    .await
    .map_err(|_| AuthError::Internal)??;

    match resolution {
        Resolution::Active(key) => Ok(key),
        Resolution::NotFound => Err(AuthError::UnknownKey),
        Resolution::Expired => Err(AuthError::ExpiredKey),
        Resolution::Revoked => Err(AuthError::RevokedKey),
    }
}
