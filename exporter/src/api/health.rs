//! Health check endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: i64,
    nodes: usize,
    fresh_nodes: usize,
    last_poll: Option<DateTime<Utc>>,
}

/// GET /health - exporter liveness plus cache freshness.
///
/// `status` is "starting" until the first poll completes.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let snapshot = state.collector.snapshot();
    let fresh_nodes = snapshot.nodes.iter().filter(|n| !n.stale).count();

    Json(HealthResponse {
        status: if snapshot.last_poll.is_some() { "ok" } else { "starting" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        nodes: snapshot.nodes.len(),
        fresh_nodes,
        last_poll: snapshot.last_poll,
    })
}
