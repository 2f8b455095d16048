//! Fleet status endpoints: node state, aggregated models, routing rules and preview.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::{routing::get, Json, Router};
use ollama_fleet_common::{ModelRange, NodeHealth, NodeSnapshot};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::routing::{RoutingRules, SizeSource};
use crate::AppState;

#[derive(Serialize)]
struct NodesResponse {
    scheduling_strategy: &'static str,
    nodes: Vec<NodeView>,
}

#[derive(Serialize)]
struct NodeView {
    id: String,
    base_url: String,
    weight: f64,
    health: NodeHealth,
    in_flight: u32,
    successes: u64,
    failures: u64,
    failure_rate: f64,
    consecutive_failures: u32,
    last_probe: Option<chrono::DateTime<chrono::Utc>>,
    last_error: Option<String>,
    last_latency_ms: Option<u64>,
    supported_model_ranges: Vec<ModelRange>,
    models: Vec<String>,
}

impl From<NodeSnapshot> for NodeView {
    fn from(node: NodeSnapshot) -> Self {
        Self {
            base_url: node.base_url(),
            weight: node.descriptor.weight,
            failure_rate: node.failure_rate(),
            supported_model_ranges: node.descriptor.supported_model_ranges.clone(),
            models: node.models.iter().cloned().collect(),
            id: node.id,
            health: node.health,
            in_flight: node.in_flight,
            successes: node.successes,
            failures: node.failures,
            consecutive_failures: node.consecutive_failures,
            last_probe: node.last_probe,
            last_error: node.last_error,
            last_latency_ms: node.last_latency_ms,
        }
    }
}

async fn list_nodes(State(state): State<Arc<AppState>>) -> Json<NodesResponse> {
    Json(NodesResponse {
        scheduling_strategy: state.dispatcher.scheduler().strategy().as_str(),
        nodes: state.registry.all().into_iter().map(NodeView::from).collect(),
    })
}

#[derive(Serialize)]
struct TagsResponse {
    models: Vec<AggregatedModel>,
}

#[derive(Serialize)]
struct AggregatedModel {
    name: String,
    model: String,
    available_on_nodes: Vec<String>,
}

/// Union of the models synced from every eligible node.
async fn aggregate_tags(State(state): State<Arc<AppState>>) -> Json<TagsResponse> {
    let mut models: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for node in state.registry.snapshot() {
        for model in node.models.iter() {
            models.entry(model.clone()).or_default().push(node.id.clone());
        }
    }

    Json(TagsResponse {
        models: models
            .into_iter()
            .map(|(name, nodes)| AggregatedModel {
                model: name.clone(),
                name,
                available_on_nodes: nodes,
            })
            .collect(),
    })
}

#[derive(Serialize)]
struct RulesResponse {
    #[serde(flatten)]
    rules: RoutingRules,
    scheduling_strategy: &'static str,
    nodes: Vec<NodeRules>,
}

#[derive(Serialize)]
struct NodeRules {
    id: String,
    base_url: String,
    health: NodeHealth,
    eligible: bool,
    supported_model_ranges: Vec<ModelRange>,
    models: Vec<String>,
}

/// Every rule the router applies: size mapping, patterns and node ranges.
async fn routing_rules(State(state): State<Arc<AppState>>) -> Json<RulesResponse> {
    let nodes = state
        .registry
        .all()
        .into_iter()
        .map(|node| NodeRules {
            base_url: node.base_url(),
            eligible: node.health.is_eligible(),
            supported_model_ranges: node.descriptor.supported_model_ranges.clone(),
            models: node.models.iter().cloned().collect(),
            id: node.id,
            health: node.health,
        })
        .collect();

    Json(RulesResponse {
        rules: state.dispatcher.router().rules(),
        scheduling_strategy: state.dispatcher.scheduler().strategy().as_str(),
        nodes,
    })
}

#[derive(Deserialize)]
struct RoutingQuery {
    model_name: Option<String>,
}

#[derive(Serialize)]
struct RoutingResponse {
    model_name: String,
    base_name: String,
    model_size_b: u32,
    size_source: SizeSource,
    patterns_matched: Vec<String>,
    candidate_nodes: Vec<String>,
    rejected_nodes: Vec<RejectedNode>,
    will_use_fallback: bool,
    fallback_nodes: Vec<String>,
    scheduling_strategy: &'static str,
}

#[derive(Serialize)]
struct RejectedNode {
    id: String,
    reasons: Vec<String>,
}

/// Which nodes a request for `model_name` would be routed to.
async fn query_routing(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RoutingQuery>,
) -> Result<Json<RoutingResponse>> {
    let model_name = query
        .model_name
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| Error::InvalidRequest("model_name is required".to_string()))?;

    let router = state.dispatcher.router();
    let requirement = router.requirement(&model_name);
    let (_, size_source) = router.estimate_size(&model_name);

    let mut candidate_nodes = Vec::new();
    let mut rejected_nodes = Vec::new();
    let mut fallback_nodes = Vec::new();

    for node in state.registry.all() {
        let mut reasons = Vec::new();
        if !node.health.is_eligible() {
            reasons.push(format!("node is {}", node.health));
        } else {
            fallback_nodes.push(node.id.clone());
        }
        if !node.has_model(&requirement.base) {
            reasons.push(format!("model '{}' not present", requirement.base));
        }
        if !node.descriptor.supports_size(requirement.size_b) {
            reasons.push(format!("{}B outside supported ranges", requirement.size_b));
        }

        if reasons.is_empty() {
            candidate_nodes.push(node.id);
        } else {
            rejected_nodes.push(RejectedNode { id: node.id, reasons });
        }
    }

    let will_use_fallback = !router.enabled() || candidate_nodes.is_empty();
    if !will_use_fallback {
        fallback_nodes.clear();
    }

    Ok(Json(RoutingResponse {
        patterns_matched: router.matching_patterns(&requirement.base),
        model_name: requirement.name,
        base_name: requirement.base,
        model_size_b: requirement.size_b,
        size_source,
        candidate_nodes,
        rejected_nodes,
        will_use_fallback,
        fallback_nodes,
        scheduling_strategy: state.dispatcher.scheduler().strategy().as_str(),
    }))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/nodes", get(list_nodes))
        .route("/api/tags", get(aggregate_tags))
        .route("/api/routing/rules", get(routing_rules))
        .route("/api/routing/query", get(query_routing))
}
