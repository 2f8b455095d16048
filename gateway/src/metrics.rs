//! Gateway request metrics and their Prometheus rendering.

use std::time::Duration;

use axum::http::Method;
use ollama_fleet_common::metrics::{self as exposition, NodeLabels};
use ollama_fleet_common::{NodeHealth, NodeRegistry};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::metrics::info::Info;
use prometheus_client::registry::Registry;

/// Label used for requests that never reached a node.
pub const NO_NODE: &str = "none";

/// Upper bounds of the request duration histogram, in seconds.
const DURATION_BUCKETS: [f64; 14] = [
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub method: String,
    pub node: String,
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DurationLabels {
    pub method: String,
    pub node: String,
}

fn duration_histogram() -> Histogram {
    Histogram::new(DURATION_BUCKETS.iter().copied())
}

/// Request counters live for the whole process. Node series are rebuilt
/// from the registry on every render so removed nodes disappear.
#[derive(Debug)]
pub struct GatewayMetrics {
    requests: Family<RequestLabels, Counter>,
    durations: Family<DurationLabels, Histogram, fn() -> Histogram>,
    total: Counter,
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let durations: Family<DurationLabels, Histogram, fn() -> Histogram> =
            Family::new_with_constructor(duration_histogram);
        Self {
            requests: Family::default(),
            durations,
            total: Counter::default(),
        }
    }

    /// Count one attempt (or one rejected request when `node` is [`NO_NODE`]).
    pub fn record(&self, method: &Method, node: &str, status: &str, elapsed: Duration) {
        self.requests
            .get_or_create(&RequestLabels {
                method: method.to_string(),
                node: node.to_string(),
                status: status.to_string(),
            })
            .inc();
        self.durations
            .get_or_create(&DurationLabels {
                method: method.to_string(),
                node: node.to_string(),
            })
            .observe(elapsed.as_secs_f64());
        self.total.inc();
    }

    /// Total of all recorded attempts.
    pub fn total(&self) -> u64 {
        self.total.get()
    }

    pub fn render(&self, nodes: &NodeRegistry) -> String {
        let mut registry = Registry::default();

        let up = Gauge::<i64>::default();
        up.set(1);
        registry.register("gateway_up", "Whether the gateway is up", up);
        registry.register(
            "gateway",
            "Gateway information",
            Info::new(vec![("version".to_string(), env!("CARGO_PKG_VERSION").to_string())]),
        );

        registry.register(
            "gateway_requests",
            "Total number of forwarding attempts",
            self.requests.clone(),
        );
        registry.register(
            "gateway_request_duration_seconds",
            "Time until the node answered with response headers",
            self.durations.clone(),
        );

        let nodes = nodes.all();

        let health = Family::<NodeLabels, Gauge>::default();
        let active = Family::<NodeLabels, Gauge>::default();
        let failures = Family::<NodeLabels, Counter>::default();
        for node in &nodes {
            let labels = NodeLabels::new(&node.id);
            let serving = matches!(node.health, NodeHealth::Healthy | NodeHealth::Degraded);
            health.get_or_create(&labels).set(i64::from(serving));
            active.get_or_create(&labels).set(i64::from(node.in_flight));
            failures.get_or_create(&labels).inc_by(node.failures);
        }

        registry.register(
            "gateway_node_health",
            "Health status of each node (1=serving, 0=not serving)",
            health,
        );
        exposition::register_node_states(
            &mut registry,
            "gateway_node_state",
            "Current health state of each node",
            nodes.iter().map(|n| (n.id.as_str(), n.health)),
        );
        registry.register(
            "gateway_active_connections",
            "Number of in-flight requests per node",
            active,
        );
        registry.register(
            "gateway_node_failures",
            "Failed forwarding attempts per node",
            failures,
        );

        exposition::render(&registry)
    }
}
