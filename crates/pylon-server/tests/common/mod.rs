//! Shared fixtures: a scriptable downstream server and a fully wired proxy.

// Each integration test binary compiles this module and uses a subset of it.
#![allow(dead_code)]

use axum::body::{Body, Bytes};
use axum::http::header;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use pylon_db::DbPool;
use pylon_gate::Gate;
use pylon_keys::ApiKey;
use pylon_record::Recorder;
use pylon_server::{admin_app, proxy_app, token::AdminTokens, AppState};
use pylon_types::{CapOverrides, PolicySnapshot, Priority};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Tracks how many requests the downstream is serving at once.
#[derive(Default)]
pub struct DownstreamLoad {
    current: AtomicU32,
    peak: AtomicU32,
}

impl DownstreamLoad {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }
}

fn sse_response(rx: mpsc::Receiver<Result<Bytes, Infallible>>) -> Response {
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .expect("static response builder")
}

/// Starts the downstream the proxy forwards to. Routes:
///
/// - `GET /` — 200, for health probes
/// - `GET /api/hello` — 200 `{"message":"hello"}`
/// - `GET /api/slow` — sleeps 300 ms, then 200
/// - `GET /api/stream?count=N` — SSE, N quick messages, then closes
/// - `GET /api/stream-idle` — SSE, one message, then silence
pub async fn spawn_downstream() -> (SocketAddr, Arc<DownstreamLoad>) {
    let load = Arc::new(DownstreamLoad::default());

    let slow_load = load.clone();
    let app = Router::new()
        .route("/", get(|| async { "ok" }))
        .route(
            "/api/hello",
            get(|| async { axum::Json(serde_json::json!({"message": "hello"})) }),
        )
        .route(
            "/api/slow",
            get(move || {
                let load = slow_load.clone();
                async move {
                    load.enter();
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    load.exit();
                    axum::Json(serde_json::json!({"message": "slow"}))
                }
            }),
        )
        .route(
            "/api/stream",
            get(
                |axum::extract::Query(params): axum::extract::Query<
                    std::collections::HashMap<String, u32>,
                >| async move {
                    let count = params.get("count").copied().unwrap_or(3);
                    let (tx, rx) = mpsc::channel(16);
                    tokio::spawn(async move {
                        for i in 0..count {
                            let frame = Bytes::from(format!("data: msg-{i}\n\n"));
                            if tx.send(Ok(frame)).await.is_err() {
                                return;
                            }
                        }
                    });
                    sse_response(rx)
                },
            ),
        )
        .route(
            "/api/stream-idle",
            get(|| async {
                let (tx, rx) = mpsc::channel(16);
                tokio::spawn(async move {
                    let frame = Bytes::from("data: first\n\n".to_string());
                    if tx.send(Ok(frame)).await.is_err() {
                        return;
                    }
                    // Hold the stream open without sending another byte.
                    tokio::time::sleep(Duration::from_secs(120)).await;
                });
                sse_response(rx)
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind downstream");
    let addr = listener.local_addr().expect("downstream addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("downstream serve");
    });

    (addr, load)
}

/// A fully wired proxy + admin pair over a temp database.
pub struct Harness {
    pub proxy: Router,
    pub admin: Router,
    pub state: Arc<AppState>,
    pub pool: DbPool,
    _db_dir: tempfile::TempDir,
}

pub const ADMIN_PASSWORD: &str = "correct horse battery staple";

/// Hex SHA-256 of [`ADMIN_PASSWORD`].
pub fn admin_password_hash() -> String {
    use sha2::Digest;
    hex::encode(sha2::Sha256::digest(ADMIN_PASSWORD.as_bytes()))
}

pub async fn setup(policy: PolicySnapshot) -> Harness {
    let db_dir = tempfile::tempdir().expect("tempdir");
    let db_path = db_dir.path().join("pylon-test.db");
    let pool = pylon_db::create_pool(
        db_path.to_str().expect("utf-8 path"),
        pylon_db::PoolSettings::default(),
    )
    .expect("pool");
    {
        let conn = pool.get().expect("conn");
        pylon_db::run_migrations(&conn).expect("migrations");
        pylon_server::policy::save(&conn, &policy).expect("seed policy");
    }

    let gate = Gate::new(policy);
    let recorder = Recorder::new(1024);
    let recorder_handle = recorder.handle();
    tokio::spawn(recorder.run(pool.clone()));

    let state = Arc::new(AppState {
        pool: pool.clone(),
        gate,
        recorder: recorder_handle,
        http: reqwest::Client::new(),
        admin_password_sha256: admin_password_hash(),
        tokens: AdminTokens::new("test-token-secret".to_string(), 3600),
    });

    Harness {
        proxy: proxy_app(state.clone()),
        admin: admin_app(state.clone()),
        state,
        pool,
        _db_dir: db_dir,
    }
}

/// A policy pointed at the given downstream, with short timeouts suitable
/// for tests.
pub fn test_policy(downstream: SocketAddr) -> PolicySnapshot {
    let mut policy = PolicySnapshot::default();
    policy.downstream.base_url = format!("http://{downstream}");
    policy.downstream.timeout_secs = 10;
    policy.queue.timeout_secs = 10;
    policy.sse.idle_timeout_secs = 1;
    policy
}

/// Creates an API key directly in the store; returns the record and the
/// plaintext credential.
pub fn mint_key(pool: &DbPool, priority: Priority, overrides: CapOverrides) -> (ApiKey, String) {
    let conn = pool.get().expect("conn");
    pylon_keys::create_key(&conn, "test key", priority, None, overrides).expect("create key")
}

/// Counts rows currently flushed to the request log.
pub fn request_log_count(pool: &DbPool) -> i64 {
    let conn = pool.get().expect("conn");
    conn.query_row("SELECT COUNT(*) FROM request_log", [], |row| row.get(0))
        .expect("count")
}

/// Waits until the request log holds at least `expected` rows.
pub async fn wait_for_records(pool: &DbPool, expected: i64) -> Vec<pylon_record::LoggedRequest> {
    for _ in 0..100 {
        if request_log_count(pool) >= expected {
            let conn = pool.get().expect("conn");
            return pylon_record::query_recent(&conn, 100).expect("recent");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("request log never reached {expected} rows");
}
