//! Prometheus plumbing shared by the gateway and the exporter.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::node::NodeHealth;

/// Content type served from `/metrics` endpoints.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Label set for per-node series.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NodeLabels {
    pub node: String,
}

impl NodeLabels {
    pub fn new(node: &str) -> Self {
        Self {
            node: node.to_string(),
        }
    }
}

/// Label set for the one-hot node state gauge.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NodeStateLabels {
    pub node: String,
    pub state: String,
}

/// Register a gauge family with one series per (node, state), set to 1 for
/// the node's current state and 0 otherwise.
pub fn register_node_states<'a>(
    registry: &mut Registry,
    name: &str,
    help: &str,
    nodes: impl IntoIterator<Item = (&'a str, NodeHealth)>,
) {
    let family = Family::<NodeStateLabels, Gauge>::default();
    for (node, health) in nodes {
        for state in NodeHealth::ALL {
            let labels = NodeStateLabels {
                node: node.to_string(),
                state: state.as_str().to_string(),
            };
            family.get_or_create(&labels).set(i64::from(health == state));
        }
    }
    registry.register(name, help, family);
}

/// Encode a registry in the text format.
pub fn render(registry: &Registry) -> String {
    let mut buffer = String::new();
    if encode(&mut buffer, registry).is_err() {
        tracing::error!("failed to encode prometheus metrics");
        return String::new();
    }
    buffer
}
