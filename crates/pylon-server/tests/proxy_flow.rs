//! End-to-end proxy scenarios against a live in-process downstream.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use common::*;
use pylon_types::{CapOverrides, Priority};
use serde_json::Value;
use std::time::Duration;
use tower::ServiceExt;

fn get(path: &str, credential: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header(header::AUTHORIZATION, format!("Bearer {credential}"))
        .body(Body::empty())
        .expect("request builder")
}

fn sse_get(path: &str, credential: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header(header::AUTHORIZATION, format!("Bearer {credential}"))
        .header(header::ACCEPT, "text/event-stream")
        .body(Body::empty())
        .expect("request builder")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

#[tokio::test]
async fn health_is_unauthenticated_and_reports_downstream() {
    let (downstream, _) = spawn_downstream().await;
    let harness = setup(test_policy(downstream)).await;

    let response = harness
        .proxy
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["downstream"], "ok");
    assert_eq!(json["queue_size"], 0);
    assert_eq!(json["active_connections"], 0);
}

#[tokio::test]
async fn missing_and_invalid_credentials_get_401() {
    let (downstream, _) = spawn_downstream().await;
    let harness = setup(test_policy(downstream)).await;

    let response = harness
        .proxy
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/hello")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["detail"], "missing API key");

    let response = harness
        .proxy
        .clone()
        .oneshot(get("/api/hello", "sk-no-such-key"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["detail"], "invalid API key");
}

#[tokio::test]
async fn revoked_key_is_refused_with_detail() {
    let (downstream, _) = spawn_downstream().await;
    let harness = setup(test_policy(downstream)).await;
    let (key, credential) = mint_key(&harness.pool, Priority::Normal, CapOverrides::default());

    {
        let conn = harness.pool.get().unwrap();
        pylon_keys::revoke_key(&conn, &key.id, chrono::Utc::now()).unwrap();
    }

    let response = harness
        .proxy
        .clone()
        .oneshot(get("/api/hello", &credential))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["detail"], "API key revoked");
}

#[tokio::test]
async fn happy_unary_round_trip_produces_one_record() {
    let (downstream, _) = spawn_downstream().await;
    let harness = setup(test_policy(downstream)).await;
    let (key, credential) = mint_key(&harness.pool, Priority::Normal, CapOverrides::default());

    let response = harness
        .proxy
        .clone()
        .oneshot(get("/api/hello", &credential))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["message"], "hello");

    let records = wait_for_records(&harness.pool, 1).await;
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.key_id, key.id);
    assert_eq!(record.api, "GET /api/hello");
    assert_eq!(record.status, 200);
    assert!(!record.is_sse);
    assert_eq!(record.sse_message_count, 0);
    assert!(!record.rate_limited);
}

#[tokio::test]
async fn user_rpm_exhaustion_answers_429_user_limit() {
    let (downstream, _) = spawn_downstream().await;
    let mut policy = test_policy(downstream);
    policy.default_user.max_rpm = 10;
    let harness = setup(policy).await;
    let (_key, credential) = mint_key(&harness.pool, Priority::Normal, CapOverrides::default());

    for i in 0..10 {
        let response = harness
            .proxy
            .clone()
            .oneshot(get("/api/hello", &credential))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "request {i} should pass");
    }

    let response = harness
        .proxy
        .clone()
        .oneshot(get("/api/hello", &credential))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let json = body_json(response).await;
    assert_eq!(json["code"], "user_limit");
}

#[tokio::test]
async fn per_api_cap_answers_429_api_limit() {
    let (downstream, _) = spawn_downstream().await;
    let mut policy = test_policy(downstream);
    policy.api_limits.push(pylon_types::ApiLimit {
        pattern: "GET /api/hello".to_string(),
        max_rpm: 2,
    });
    let harness = setup(policy).await;
    let (_key, credential) = mint_key(&harness.pool, Priority::Normal, CapOverrides::default());

    for _ in 0..2 {
        let response = harness
            .proxy
            .clone()
            .oneshot(get("/api/hello", &credential))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = harness
        .proxy
        .clone()
        .oneshot(get("/api/hello", &credential))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_json(response).await["code"], "api_limit");
}

#[tokio::test]
async fn concurrency_cap_queues_and_serves_all() {
    let (downstream, load) = spawn_downstream().await;
    let mut policy = test_policy(downstream);
    policy.default_user.max_concurrent = 2;
    let harness = setup(policy).await;
    let (_key, credential) = mint_key(&harness.pool, Priority::Normal, CapOverrides::default());

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let proxy = harness.proxy.clone();
        let request = get("/api/slow", &credential);
        tasks.push(tokio::spawn(async move {
            proxy.oneshot(request).await.unwrap().status()
        }));
    }

    for task in tasks {
        assert_eq!(task.await.unwrap(), StatusCode::OK);
    }

    // The third request waited for a slot instead of overflowing the cap.
    assert!(
        load.peak() <= 2,
        "downstream saw {} concurrent requests, cap is 2",
        load.peak()
    );
}

#[tokio::test]
async fn full_queue_rejects_with_queue_full() {
    let (downstream, _) = spawn_downstream().await;
    let mut policy = test_policy(downstream);
    policy.default_user.max_concurrent = 1;
    policy.queue.max_size = 0;
    let harness = setup(policy).await;
    let (_key, credential) = mint_key(&harness.pool, Priority::Normal, CapOverrides::default());

    let proxy = harness.proxy.clone();
    let request = get("/api/slow", &credential);
    let holder = tokio::spawn(async move { proxy.oneshot(request).await.unwrap().status() });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = harness
        .proxy
        .clone()
        .oneshot(get("/api/slow", &credential))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["code"], "queue_full");

    assert_eq!(holder.await.unwrap(), StatusCode::OK);
}

#[tokio::test]
async fn high_priority_arrival_preempts_parked_normal_waiter() {
    let (downstream, _) = spawn_downstream().await;
    let mut policy = test_policy(downstream);
    policy.default_user.max_concurrent = 5;
    policy.global.max_concurrent = 1;
    policy.queue.max_size = 1;
    let harness = setup(policy).await;

    let (_normal, normal_credential) =
        mint_key(&harness.pool, Priority::Normal, CapOverrides::default());
    let (_vip, vip_credential) = mint_key(&harness.pool, Priority::High, CapOverrides::default());

    // Occupy the only slot.
    let proxy = harness.proxy.clone();
    let request = get("/api/slow", &normal_credential);
    let holder = tokio::spawn(async move { proxy.oneshot(request).await.unwrap().status() });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Park a normal waiter in the single queue slot.
    let proxy = harness.proxy.clone();
    let request = get("/api/slow", &normal_credential);
    let parked = tokio::spawn(async move { proxy.oneshot(request).await.unwrap() });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The high-priority arrival evicts it.
    let proxy = harness.proxy.clone();
    let request = get("/api/slow", &vip_credential);
    let vip = tokio::spawn(async move { proxy.oneshot(request).await.unwrap().status() });

    let parked_response = parked.await.unwrap();
    assert_eq!(parked_response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(parked_response).await["code"], "preempted");

    assert_eq!(holder.await.unwrap(), StatusCode::OK);
    assert_eq!(vip.await.unwrap(), StatusCode::OK);
}

#[tokio::test]
async fn sse_messages_pass_through_until_rate_cap_terminates() {
    let (downstream, _) = spawn_downstream().await;
    let policy = test_policy(downstream);
    let harness = setup(policy).await;
    let (key, credential) = mint_key(
        &harness.pool,
        Priority::Normal,
        CapOverrides {
            max_rpm: Some(5),
            ..CapOverrides::default()
        },
    );

    let response = harness
        .proxy
        .clone()
        .oneshot(sse_get("/api/stream?count=10", &credential))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    let body = body_text(response).await;
    for i in 0..5 {
        assert!(body.contains(&format!("data: msg-{i}\n\n")), "missing msg-{i}");
    }
    assert!(!body.contains("data: msg-5\n\n"), "sixth message leaked through");
    assert!(body.contains("event: pylon_error\ndata: {\"code\":\"rate_limit_exceeded\""));

    let records = wait_for_records(&harness.pool, 1).await;
    let record = &records[0];
    assert_eq!(record.key_id, key.id);
    assert!(record.is_sse);
    assert_eq!(record.sse_message_count, 5);
    assert!(record.rate_limited);
}

#[tokio::test]
async fn sse_idle_stream_terminates_with_idle_timeout() {
    let (downstream, _) = spawn_downstream().await;
    let policy = test_policy(downstream); // idle_timeout_secs = 1
    let harness = setup(policy).await;
    let (_key, credential) = mint_key(&harness.pool, Priority::Normal, CapOverrides::default());

    let started = std::time::Instant::now();
    let response = harness
        .proxy
        .clone()
        .oneshot(sse_get("/api/stream-idle", &credential))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_text(response).await;
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(body.contains("data: first\n\n"));
    assert!(body.contains("event: pylon_error\ndata: {\"code\":\"idle_timeout\""));

    // The SSE gauge must return to zero once the stream closes.
    for _ in 0..50 {
        if harness.state.gate.active_connections() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(harness.state.gate.active_connections(), 0);

    let records = wait_for_records(&harness.pool, 1).await;
    assert!(records[0].is_sse);
    assert_eq!(records[0].sse_message_count, 1);
}

#[tokio::test]
async fn unreachable_downstream_answers_502() {
    // A port nothing listens on.
    let unused = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let harness = setup(test_policy(unused)).await;
    let (_key, credential) = mint_key(&harness.pool, Priority::Normal, CapOverrides::default());

    let response = harness
        .proxy
        .clone()
        .oneshot(get("/api/hello", &credential))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_json(response).await["code"], "downstream_error");

    // The slot was released on the failure path.
    assert_eq!(harness.state.gate.active_connections(), 0);

    let records = wait_for_records(&harness.pool, 1).await;
    assert_eq!(records[0].status, 502);
}

#[tokio::test]
async fn counters_settle_after_a_burst() {
    let (downstream, _) = spawn_downstream().await;
    let mut policy = test_policy(downstream);
    policy.default_user.max_concurrent = 4;
    let harness = setup(policy).await;
    let (_key, credential) = mint_key(&harness.pool, Priority::Normal, CapOverrides::default());

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let proxy = harness.proxy.clone();
        let request = get("/api/slow", &credential);
        tasks.push(tokio::spawn(async move {
            proxy.oneshot(request).await.unwrap().status()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), StatusCode::OK);
    }

    // Releases happen in the relay tasks; give them a moment to settle.
    for _ in 0..50 {
        if harness.state.gate.active_connections() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(harness.state.gate.active_connections(), 0);
    assert_eq!(harness.state.gate.queue_len(), 0);

    // Exactly one record per accepted request.
    let records = wait_for_records(&harness.pool, 8).await;
    assert_eq!(records.len(), 8);
}
