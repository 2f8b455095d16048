use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::Router;
use http::{Request, StatusCode};
use ollama_fleet_common::{NodeDescriptor, NodeHealth};
use ollama_fleet_gateway::{app, AppState, Config, HealthMonitor};
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(nodes: &[(&str, &MockServer)]) -> Config {
    let mut config = Config::default();
    config.health.probe_jitter_ms = 0;
    config.dispatch.attempt_timeout_secs = 1;
    config.nodes = nodes
        .iter()
        .map(|(id, server)| json!({ "id": id, "base_url": server.uri() }))
        .collect();
    config
}

fn build(config: &Config) -> (Arc<AppState>, HealthMonitor, Router) {
    let (state, monitor) = AppState::build(config, "unused").unwrap();
    let router = app(state.clone());
    (state, monitor, router)
}

async fn node_answering(name: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "node": name, "done": true })))
        .mount(&server)
        .await;
    server
}

async fn node_failing(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

fn generate(model: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/generate")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "model": model, "prompt": "hi", "stream": false }).to_string(),
        ))
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, value)
}

async fn served_by(app: &Router) -> String {
    let (status, body) = send(app, generate("llama3")).await;
    assert_eq!(status, StatusCode::OK, "unexpected body: {}", body);
    body["node"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_round_robin_across_three_nodes() {
    let a = node_answering("a").await;
    let b = node_answering("b").await;
    let c = node_answering("c").await;
    let (_state, _monitor, app) = build(&config_for(&[("a", &a), ("b", &b), ("c", &c)]));

    let mut picked = Vec::new();
    for _ in 0..5 {
        picked.push(served_by(&app).await);
    }
    assert_eq!(picked, vec!["a", "b", "c", "a", "b"]);
}

#[tokio::test]
async fn test_failing_node_becomes_unreachable_and_is_skipped() {
    let a = node_answering("a").await;
    let b = node_failing(500).await;
    let c = node_answering("c").await;
    let (state, _monitor, app) = build(&config_for(&[("a", &a), ("b", &b), ("c", &c)]));

    // Every request still succeeds through failover.
    for _ in 0..6 {
        let node = served_by(&app).await;
        assert_ne!(node, "b");
    }

    let node_b = state.registry.get("b").unwrap();
    assert_eq!(node_b.health, NodeHealth::Unreachable);
    assert_eq!(node_b.failures, 3);
    assert_eq!(b.received_requests().await.unwrap().len(), 3);

    let mut picked = Vec::new();
    for _ in 0..4 {
        picked.push(served_by(&app).await);
    }
    for pair in picked.windows(2) {
        assert_ne!(pair[0], pair[1], "expected alternation, got {:?}", picked);
    }
    assert_eq!(b.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_all_unreachable_returns_503_without_network_call() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    for server in [&a, &b] {
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(server)
            .await;
    }
    let (state, _monitor, app) = build(&config_for(&[("a", &a), ("b", &b)]));
    state.registry.set_health("a", NodeHealth::Unreachable);
    state.registry.set_health("b", NodeHealth::Unreachable);

    let (status, body) = send(&app, generate("llama3")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["type"], "no_healthy_node");
}

#[tokio::test]
async fn test_attempts_bounded_by_max_attempts() {
    let servers = [
        node_failing(503).await,
        node_failing(503).await,
        node_failing(503).await,
        node_failing(503).await,
    ];
    let mut config = config_for(&[
        ("a", &servers[0]),
        ("b", &servers[1]),
        ("c", &servers[2]),
        ("d", &servers[3]),
    ]);
    config.dispatch.max_attempts = 2;
    let (_state, _monitor, app) = build(&config);

    let (status, _) = send(&app, generate("llama3")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let mut hits = Vec::new();
    for server in &servers {
        hits.push(server.received_requests().await.unwrap().len());
    }
    assert_eq!(hits.iter().sum::<usize>(), 2);
    assert!(hits.iter().all(|&h| h <= 1), "a node was tried twice: {:?}", hits);
}

#[tokio::test]
async fn test_client_errors_are_returned_verbatim() {
    let a = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({ "error": "model 'nope' not found" })),
        )
        .mount(&a)
        .await;
    let b = node_answering("b").await;
    let (state, _monitor, app) = build(&config_for(&[("a", &a), ("b", &b)]));

    let (status, body) = send(&app, generate("nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "model 'nope' not found");
    assert!(b.received_requests().await.unwrap().is_empty());
    assert_eq!(state.registry.get("a").unwrap().failures, 0);
}

#[tokio::test]
async fn test_slow_node_times_out_and_fails_over() {
    let slow = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&slow)
        .await;
    let b = node_answering("b").await;
    let (state, _monitor, app) = build(&config_for(&[("slow", &slow), ("b", &b)]));

    assert_eq!(served_by(&app).await, "b");
    let node = state.registry.get("slow").unwrap();
    assert_eq!(node.failures, 1);
    assert!(node.last_error.unwrap().contains("did not respond"));
}

#[tokio::test]
async fn test_deadline_exceeded_returns_504() {
    let slow = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&slow)
        .await;
    let mut config = config_for(&[("slow", &slow)]);
    config.dispatch.attempt_timeout_secs = 30;
    config.dispatch.request_deadline_secs = 1;
    let (_state, _monitor, app) = build(&config);

    let (status, body) = send(&app, generate("llama3")).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error"]["type"], "timeout");
}

#[tokio::test]
async fn test_deadline_cutting_the_last_attempt_returns_504() {
    let slow = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&slow)
        .await;
    let mut config = config_for(&[("slow", &slow)]);
    config.dispatch.max_attempts = 1;
    config.dispatch.attempt_timeout_secs = 30;
    config.dispatch.request_deadline_secs = 1;
    let (_state, _monitor, app) = build(&config);

    let (status, body) = send(&app, generate("llama3")).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error"]["type"], "timeout");
}

#[tokio::test]
async fn test_caller_disconnect_still_reports_the_attempt() {
    let slow = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&slow)
        .await;
    let (state, _monitor, app) = build(&config_for(&[("slow", &slow)]));

    let abandoned =
        tokio::time::timeout(Duration::from_millis(300), app.clone().oneshot(generate("llama3")))
            .await;
    assert!(abandoned.is_err());
    assert_eq!(slow.received_requests().await.unwrap().len(), 1);

    let node = state.registry.get("slow").unwrap();
    assert_eq!(node.in_flight, 0);
    assert_eq!(node.successes, 0);
    assert_eq!(node.failures, 1);
    assert!(node.last_error.unwrap().contains("cancelled"));
}

#[tokio::test]
async fn test_node_removed_while_request_in_flight() {
    let a = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "node": "a" }))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&a)
        .await;
    let b = node_answering("b").await;
    let (state, _monitor, app) = build(&config_for(&[("a", &a), ("b", &b)]));

    let pending = tokio::spawn({
        let app = app.clone();
        async move { send(&app, generate("llama3")).await }
    });

    for _ in 0..100 {
        if state.registry.get("a").map(|n| n.in_flight) == Some(1) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let summary = state
        .registry
        .reconcile(vec![NodeDescriptor::new("b", "127.0.0.1", 1).with_base_url(b.uri())]);
    assert_eq!(summary.removed, vec!["a".to_string()]);

    let (status, body) = pending.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["node"], "a");
    assert!(state.registry.get("a").is_none());
    assert_eq!(served_by(&app).await, "b");
}

#[tokio::test]
async fn test_requests_prefer_nodes_holding_the_model() {
    let small = node_answering("small").await;
    let big = node_answering("big").await;
    let mut config = config_for(&[("small", &small), ("big", &big)]);
    config.nodes = vec![
        json!({ "id": "small", "base_url": small.uri(), "supported_model_ranges": [{ "min_params_b": 0, "max_params_b": 14 }] }),
        json!({ "id": "big", "base_url": big.uri(), "supported_model_ranges": [{ "min_params_b": 14 }] }),
    ];
    let (state, _monitor, app) = build(&config);
    for id in ["small", "big"] {
        state
            .registry
            .update_models(id, ["llama3".to_string()].into_iter().collect());
    }

    for _ in 0..3 {
        let (_, body) = send(&app, generate("llama3:70b")).await;
        assert_eq!(body["node"], "big");
    }
    for _ in 0..3 {
        let (_, body) = send(&app, generate("llama3:8b")).await;
        assert_eq!(body["node"], "small");
    }
}

#[tokio::test]
async fn test_external_node_gets_bearer_token_and_streams() {
    let cloud = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/x-ndjson")
                .set_body_string("{\"response\":\"he\"}\n{\"response\":\"llo\",\"done\":true}\n"),
        )
        .expect(1)
        .mount(&cloud)
        .await;
    let mut config = Config::default();
    config.nodes = vec![json!({ "name": "cloud", "api_url": cloud.uri(), "api_key": "secret" })];
    let (state, _monitor, app) = build(&config);

    let response = app.clone().oneshot(generate("llama3")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/x-ndjson");
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.iter().filter(|&&b| b == b'\n').count(), 2);
    assert_eq!(state.registry.get("cloud").unwrap().in_flight, 0);
}
