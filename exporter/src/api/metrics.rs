//! Metrics and snapshot endpoints. Both read the collector's cache only.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use ollama_fleet_common::metrics::{self as exposition, NodeLabels, CONTENT_TYPE};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::collector::{CachedNode, CollectorSnapshot};
use crate::error::{Error, Result};
use crate::state::AppState;

/// GET /metrics - Prometheus text exposition of the cached node state.
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let body = render(&state.collector.snapshot());
    (StatusCode::OK, [(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response()
}

/// GET /snapshot - the cache as JSON.
async fn snapshot(State(state): State<Arc<AppState>>) -> Json<CollectorSnapshot> {
    Json(state.collector.snapshot())
}

/// GET /snapshot/:node - one node's cache entry.
async fn node_snapshot(
    State(state): State<Arc<AppState>>,
    Path(node): Path<String>,
) -> Result<Json<CachedNode>> {
    state
        .collector
        .snapshot()
        .nodes
        .into_iter()
        .find(|n| n.id == node)
        .map(Json)
        .ok_or(Error::NodeNotFound(node))
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ModelLabels {
    node: String,
    model: String,
}

/// Build a fresh registry from the cache and encode it.
pub fn render(snapshot: &CollectorSnapshot) -> String {
    let mut registry = Registry::default();

    let up = Gauge::<i64>::default();
    up.set(1);
    registry.register("ollama_exporter_up", "Whether the exporter is running", up);

    let node_up = Family::<NodeLabels, Gauge>::default();
    let stale = Family::<NodeLabels, Gauge>::default();
    let age = Family::<NodeLabels, Gauge<f64, AtomicU64>>::default();
    let failures = Family::<NodeLabels, Counter>::default();
    for node in &snapshot.nodes {
        let labels = NodeLabels::new(&node.id);
        let ok = node.last_success.is_some() && node.last_error.is_none();
        node_up.get_or_create(&labels).set(i64::from(ok));
        stale.get_or_create(&labels).set(i64::from(node.stale));
        if let Some(seconds) = node.age_seconds {
            age.get_or_create(&labels).set(seconds);
        }
        failures.get_or_create(&labels).inc_by(node.failures);
    }
    registry.register(
        "ollama_node_up",
        "Whether the last scrape of the node succeeded (1/0)",
        node_up,
    );
    exposition::register_node_states(
        &mut registry,
        "ollama_node_health_state",
        "Health state of each node (1 for the current state)",
        snapshot.nodes.iter().map(|n| (n.id.as_str(), n.health)),
    );
    registry.register(
        "ollama_node_stale",
        "Whether the cached metrics are stale or errored (1/0)",
        stale,
    );
    registry.register(
        "ollama_node_scrape_age_seconds",
        "Seconds since the last successful scrape",
        age,
    );
    registry.register(
        "ollama_node_scrape_failures",
        "Failed scrapes per node",
        failures,
    );

    let latency = Family::<NodeLabels, Gauge<f64, AtomicU64>>::default();
    let loaded = Family::<NodeLabels, Gauge>::default();
    let available = Family::<NodeLabels, Gauge>::default();
    let vram = Family::<NodeLabels, Gauge>::default();
    let model_size = Family::<ModelLabels, Gauge>::default();
    let model_vram = Family::<ModelLabels, Gauge>::default();
    for node in &snapshot.nodes {
        let Some(metrics) = &node.metrics else { continue };
        let labels = NodeLabels::new(&node.id);
        latency
            .get_or_create(&labels)
            .set(metrics.latency_ms as f64 / 1000.0);
        loaded
            .get_or_create(&labels)
            .set(metrics.loaded_models.len() as i64);
        available
            .get_or_create(&labels)
            .set(metrics.available_models as i64);
        vram.get_or_create(&labels).set(metrics.vram_bytes() as i64);
        for model in &metrics.loaded_models {
            let labels = ModelLabels {
                node: node.id.clone(),
                model: model.name.clone(),
            };
            model_size.get_or_create(&labels).set(model.size_bytes as i64);
            model_vram.get_or_create(&labels).set(model.vram_bytes as i64);
        }
    }
    registry.register(
        "ollama_node_scrape_latency_seconds",
        "Latency of the last successful scrape",
        latency,
    );
    registry.register("ollama_node_loaded_models", "Models loaded in memory", loaded);
    registry.register(
        "ollama_node_available_models",
        "Models installed on the node",
        available,
    );
    registry.register("ollama_node_vram_bytes", "VRAM used by loaded models", vram);
    registry.register(
        "ollama_model_size_bytes",
        "Memory footprint of each loaded model",
        model_size,
    );
    registry.register(
        "ollama_model_vram_bytes",
        "VRAM held by each loaded model",
        model_vram,
    );

    if let Some(local) = &snapshot.local {
        let labels = NodeLabels::new(&local.node);

        let established = Family::<NodeLabels, Gauge>::default();
        established
            .get_or_create(&labels)
            .set(local.sample.established as i64);
        registry.register(
            "ollama_tcp_established",
            "ESTABLISHED TCP connections to the local Ollama port",
            established,
        );

        let listening = Family::<NodeLabels, Gauge>::default();
        listening
            .get_or_create(&labels)
            .set(i64::from(local.sample.listening));
        registry.register(
            "ollama_tcp_listen_up",
            "Whether the local Ollama port is LISTENing (1/0)",
            listening,
        );

        let new_connections = Family::<NodeLabels, Counter>::default();
        new_connections
            .get_or_create(&labels)
            .inc_by(local.sample.new_connections_total);
        registry.register(
            "ollama_tcp_new_connections",
            "Approximate new TCP connections (increases of the established count)",
            new_connections,
        );
    }

    exposition::render(&registry)
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/snapshot", get(snapshot))
        .route("/snapshot/:node", get(node_snapshot))
}
