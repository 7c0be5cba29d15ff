//! Integration tests for the HTTP transport and the failover dispatcher.
//!
//! Every worker is a local wiremock server, so these run without network
//! access: cargo test --test dispatch_failover

use std::sync::Arc;
use std::time::{Duration, Instant};

use prompt_relay::config::WorkerTimeouts;
use prompt_relay::dispatch::Dispatcher;
use prompt_relay::error::{DispatchError, WorkerError};
use prompt_relay::workers::{
    FailureKind, HealthAggregator, HttpTransport, Outcome, PoolStatus, WorkerCall, WorkerClient,
    WorkerRegistry, WorkerRoute, WorkerTransport,
};
use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn start_workers(count: usize) -> Vec<MockServer> {
    let mut servers = Vec::with_capacity(count);
    for _ in 0..count {
        servers.push(MockServer::start().await);
    }
    servers
}

fn transport_for(servers: &[MockServer]) -> Arc<HttpTransport> {
    let registry = WorkerRegistry::from_urls(servers.iter().map(|s| s.uri()))
        .expect("mock urls are valid");
    Arc::new(HttpTransport::new(Arc::new(registry)).expect("client builds"))
}

fn client_for(servers: &[MockServer], timeouts: WorkerTimeouts) -> WorkerClient {
    WorkerClient::new(transport_for(servers), timeouts)
}

fn search_success(json_text: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "ok": true,
        "result": {"json": json_text, "raw_text": "captured page text"}
    }))
}

async fn search_calls(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == "/search")
        .count()
}

#[tokio::test]
async fn test_busy_worker_fails_over_to_second() {
    let servers = start_workers(3).await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(423).set_body_json(json!({"error": "Locked"})))
        .mount(&servers[0])
        .await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .and(body_json(json!({"prompt": "acme pricing"})))
        .respond_with(search_success("{\"plan\":\"pro\"}"))
        .mount(&servers[1])
        .await;

    let dispatcher = Dispatcher::new(client_for(&servers, WorkerTimeouts::default()));
    let output = dispatcher.dispatch("acme pricing").await.unwrap();

    assert_eq!(output.used_worker, 2);
    assert_eq!(output.json, "{\"plan\":\"pro\"}");
    assert_eq!(output.raw_text.as_deref(), Some("captured page text"));
    assert_eq!(search_calls(&servers[2]).await, 0);
}

#[tokio::test]
async fn test_empty_result_completes_with_raw_text() {
    let servers = start_workers(2).await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "error": "empty_result",
            "raw_text": "No matches for this query"
        })))
        .mount(&servers[0])
        .await;

    let dispatcher = Dispatcher::new(client_for(&servers, WorkerTimeouts::default()));
    let output = dispatcher.dispatch("obscure query").await.unwrap();

    assert_eq!(output.used_worker, 1);
    assert_eq!(output.json, "");
    assert_eq!(output.raw_text.as_deref(), Some("No matches for this query"));
    assert_eq!(search_calls(&servers[1]).await, 0);
}

#[tokio::test]
async fn test_blocked_worker_stops_the_dispatch() {
    let servers = start_workers(2).await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({
            "error": "captcha wall",
            "retry_other_worker": true
        })))
        .mount(&servers[0])
        .await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(search_success("{}"))
        .mount(&servers[1])
        .await;

    let dispatcher = Dispatcher::new(client_for(&servers, WorkerTimeouts::default()));
    let err = dispatcher.dispatch("prompt").await.unwrap_err();

    match err {
        DispatchError::UpstreamBlocked { worker, message } => {
            assert_eq!(worker, 1);
            assert!(message.contains("captcha wall"));
        }
        other => panic!("expected UpstreamBlocked, got {:?}", other),
    }
    assert_eq!(search_calls(&servers[1]).await, 0);
}

#[tokio::test]
async fn test_slow_and_failing_workers_exhaust_the_pool() {
    let servers = start_workers(3).await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(search_success("{}").set_delay(Duration::from_secs(5)))
        .mount(&servers[0])
        .await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": "warming_up"})))
        .mount(&servers[1])
        .await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(500).set_body_string("x".repeat(1000)))
        .mount(&servers[2])
        .await;

    let timeouts = WorkerTimeouts {
        search: Duration::from_millis(200),
        ..WorkerTimeouts::default()
    };
    let dispatcher = Dispatcher::new(client_for(&servers, timeouts));

    let started = Instant::now();
    let err = dispatcher.dispatch("prompt").await.unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(3));
    match err {
        DispatchError::AllWorkersExhausted { tried, last_error } => {
            assert_eq!(tried, 3);
            assert!(last_error.starts_with("worker 3: HTTP 500"));
            // Non-JSON error bodies are truncated
            assert!(last_error.ends_with("..."));
            assert!(last_error.len() < 300);
        }
        other => panic!("expected AllWorkersExhausted, got {:?}", other),
    }
}

#[tokio::test]
async fn test_transport_surfaces_error_payload() {
    let servers = start_workers(1).await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({
            "error": "warming_up",
            "eta_seconds": 12
        })))
        .mount(&servers[0])
        .await;

    let transport = transport_for(&servers);
    let call = WorkerCall::new(1, WorkerRoute::Search, Duration::from_secs(2))
        .with_body(json!({"prompt": "p"}));

    match transport.call(call).await.unwrap() {
        Outcome::Fail(failure) => {
            assert_eq!(failure.status, Some(503));
            assert_eq!(failure.kind, FailureKind::WarmingUp);
            assert_eq!(failure.payload.unwrap()["eta_seconds"], 12);
        }
        Outcome::Ok(value) => panic!("expected failure, got {}", value),
    }
}

#[tokio::test]
async fn test_transport_rejects_unknown_worker_index() {
    let servers = start_workers(2).await;
    let transport = transport_for(&servers);

    let err = transport
        .call(WorkerCall::new(3, WorkerRoute::Health, Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WorkerError::InvalidWorkerIndex { index: 3, count: 2 }
    ));
}

#[tokio::test]
async fn test_admin_routes_hit_worker_paths() {
    let servers = start_workers(1).await;
    for route in ["/session/refresh", "/browser/restart", "/tabs/search"] {
        Mock::given(method("POST"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&servers[0])
            .await;
    }

    let client = client_for(&servers, WorkerTimeouts::default());
    assert!(client.refresh_session(1).await.unwrap().is_ok());
    assert!(client.restart_browser(1).await.unwrap().is_ok());
    assert!(client.open_search_tab(1).await.unwrap().is_ok());
}

#[tokio::test]
async fn test_health_degraded_when_one_worker_times_out() {
    let servers = start_workers(3).await;
    for (i, server) in servers.iter().enumerate() {
        let mut response = ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "busy": false,
            "ready": true,
            "browser": format!("chromium-{}", i + 1)
        }));
        if i == 2 {
            response = response.set_delay(Duration::from_secs(5));
        }
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(response)
            .mount(server)
            .await;
    }

    let timeouts = WorkerTimeouts {
        health: Duration::from_millis(200),
        ..WorkerTimeouts::default()
    };
    let started = Instant::now();
    let health = HealthAggregator::new(client_for(&servers, timeouts)).check().await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(health.status, PoolStatus::Degraded);
    assert_eq!(health.healthy, 2);
    assert_eq!(health.total, 3);
    assert_eq!(health.details[0].browser.as_deref(), Some("chromium-1"));
    let slow = &health.details[2];
    assert_eq!(slow.worker, 3);
    assert!(slow.error.is_some());
}
