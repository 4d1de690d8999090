//! Pylon server binary — an authenticating, rate-limiting reverse proxy.
//!
//! Starts two axum listeners (proxy and admin) with structured logging,
//! database initialization, the recorder and retention workers, and
//! graceful shutdown on SIGTERM/SIGINT.

use pylon_server::{admin_app, config, policy, proxy_app, token::AdminTokens, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Load configuration
    let config_path =
        std::env::var("PYLON_CONFIG").unwrap_or_else(|_| "pylon.yaml".to_string());
    let config = config::load_config(Some(&config_path))
        .expect("failed to load configuration — the server cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Initialize database
    let pool = pylon_db::create_pool(&config.database.path, config.database.pool_settings())
        .expect("failed to create database pool — check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied = pylon_db::run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }

    // Load the dynamic policy and build the admission gate
    let snapshot = {
        let conn = pool
            .get()
            .expect("failed to get database connection for policy load");
        policy::load_or_init(&conn).expect("failed to load stored policy")
    };
    snapshot
        .validate()
        .expect("stored policy failed validation — fix it via the admin API or database");
    let gate = pylon_gate::Gate::new(snapshot);

    // Recorder
    let recorder = pylon_record::Recorder::new(config.recorder.buffer_capacity);
    let recorder_handle = recorder.handle();
    tokio::spawn(recorder.run(pool.clone()));

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build downstream http client");

    let state = Arc::new(AppState {
        pool,
        gate,
        recorder: recorder_handle,
        http,
        admin_password_sha256: config.admin.password_sha256.clone(),
        tokens: AdminTokens::new(config.admin.token_secret.clone(), config.admin.token_ttl_secs),
    });

    // Background retention sweep
    tokio::spawn(pylon_server::background::start_retention_task(state.clone()));

    // Bind both listeners
    let proxy_addr = SocketAddr::new(config.server.host, config.server.proxy_port);
    let admin_addr = SocketAddr::new(config.server.host, config.server.admin_port);

    let proxy_listener = TcpListener::bind(proxy_addr)
        .await
        .expect("failed to bind proxy port — is another process using it?");
    let admin_listener = TcpListener::bind(admin_addr)
        .await
        .expect("failed to bind admin port — is another process using it?");

    tracing::info!(%proxy_addr, %admin_addr, "starting pylon server");

    // One shutdown broadcast feeds both serve loops.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(());
    });

    let proxy_shutdown = {
        let mut rx = shutdown_rx.clone();
        async move {
            let _ = rx.changed().await;
        }
    };
    let admin_shutdown = {
        let mut rx = shutdown_rx;
        async move {
            let _ = rx.changed().await;
        }
    };

    let proxy_server = async {
        axum::serve(
            proxy_listener,
            proxy_app(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(proxy_shutdown)
        .await
    };

    let admin_server = async {
        axum::serve(
            admin_listener,
            admin_app(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(admin_shutdown)
        .await
    };

    tokio::try_join!(proxy_server, admin_server).expect("server error");

    tracing::info!("pylon server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
