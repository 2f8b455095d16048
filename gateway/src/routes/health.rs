use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use ollama_fleet_common::metrics::CONTENT_TYPE;
use ollama_fleet_common::NodeHealth;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    strategy: &'static str,
    uptime_secs: i64,
    healthy_nodes: usize,
    eligible_nodes: usize,
    total_nodes: usize,
    requests_total: u64,
    nodes: BTreeMap<String, NodeSummary>,
}

#[derive(Serialize)]
struct NodeSummary {
    health: NodeHealth,
    healthy: bool,
    active_connections: u32,
    total_requests: u64,
    failed_requests: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let nodes = state.registry.all();
    let healthy_nodes = nodes.iter().filter(|n| n.health == NodeHealth::Healthy).count();
    let eligible_nodes = nodes.iter().filter(|n| n.health.is_eligible()).count();

    Json(HealthResponse {
        status: if eligible_nodes > 0 { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        strategy: state.dispatcher.scheduler().strategy().as_str(),
        uptime_secs: (chrono::Utc::now() - state.started_at).num_seconds(),
        healthy_nodes,
        eligible_nodes,
        total_nodes: nodes.len(),
        requests_total: state.metrics.total(),
        nodes: nodes
            .into_iter()
            .map(|n| {
                let summary = NodeSummary {
                    health: n.health,
                    healthy: n.health == NodeHealth::Healthy,
                    active_connections: n.in_flight,
                    total_requests: n.successes + n.failures,
                    failed_requests: n.failures,
                };
                (n.id, summary)
            })
            .collect(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let body = state.metrics.render(&state.registry);
    (StatusCode::OK, [(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response()
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
}
