//! Pylon server library logic.
//!
//! Two routers share one [`AppState`]: the proxy app (client-facing, every
//! route except `/health` is authenticated and proxied) and the admin app
//! (key CRUD, policy, monitoring, statistics).

pub mod api_admin;
pub mod auth;
pub mod background;
pub mod config;
pub mod policy;
pub mod proxy;
pub mod token;

use axum::{routing::get, routing::post, Extension, Json, Router};
use pylon_db::DbPool;
use pylon_gate::Gate;
use pylon_record::RecorderHandle;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use token::AdminTokens;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// How long the health endpoint waits for the downstream probe.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Application state shared across all request handlers on both ports.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Admission controller: counter bank, wait queue, policy snapshot.
    pub gate: Gate,
    /// Fire-and-forget completion recorder.
    pub recorder: RecorderHandle,
    /// Downstream HTTP client. Built once; reqwest pools connections.
    pub http: reqwest::Client,
    /// Hex SHA-256 of the admin password; empty disables admin login.
    pub admin_password_sha256: String,
    /// Admin bearer token signer/verifier.
    pub tokens: AdminTokens,
}

/// Handler for `GET /health` on the proxy port. Unauthenticated.
async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    let base_url = state.gate.current_policy().downstream.base_url.clone();
    let downstream = match state
        .http
        .get(&base_url)
        .timeout(HEALTH_PROBE_TIMEOUT)
        .send()
        .await
    {
        Ok(_) => "ok",
        Err(e) => {
            tracing::debug!(error = %e, url = %base_url, "downstream health probe failed");
            "error"
        }
    };

    Json(json!({
        "status": "ok",
        "downstream": downstream,
        "queue_size": state.gate.queue_len(),
        "active_connections": state.gate.active_connections(),
    }))
}

/// Builds the client-facing proxy router.
pub fn proxy_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(proxy::proxy_handler)
        .layer(TraceLayer::new_for_http())
        .layer(Extension(state))
}

/// Builds the admin router.
pub fn admin_app(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route(
            "/admin/keys",
            get(api_admin::list_keys_handler).post(api_admin::create_key_handler),
        )
        .route(
            "/admin/keys/{id}",
            get(api_admin::get_key_handler)
                .patch(api_admin::update_key_handler)
                .delete(api_admin::delete_key_handler),
        )
        .route(
            "/admin/keys/{id}/refresh",
            post(api_admin::refresh_key_handler),
        )
        .route(
            "/admin/keys/{id}/revoke",
            post(api_admin::revoke_key_handler),
        )
        .route(
            "/admin/policy",
            get(api_admin::get_policy_handler).put(api_admin::update_policy_handler),
        )
        .route("/admin/monitor", get(api_admin::monitor_handler))
        .route("/admin/stats", get(api_admin::stats_handler))
        .route("/admin/requests", get(api_admin::recent_requests_handler))
        .layer(axum::middleware::from_fn(api_admin::admin_auth_middleware));

    Router::new()
        .route("/admin/login", post(api_admin::login_handler))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(state))
}
