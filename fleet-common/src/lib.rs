//! Ollama Fleet Common Types
//!
//! Shared by the gateway and the exporter: node descriptors, the node
//! registry with its health state machine, Ollama status payloads and the
//! Prometheus label sets both services export.

pub mod metrics;
pub mod node;
pub mod ollama;
pub mod registry;

pub use node::{
    parse_descriptors, resolve_env, DescriptorError, ModelRange, NodeDescriptor, NodeHealth, ParsedNodes,
    DEFAULT_OLLAMA_PORT,
};
pub use ollama::{strip_tag, PsResponse, RunningModel, TagModel, TagsResponse};
pub use registry::{
    HealthThresholds, HealthTransition, InFlightGuard, NodeRegistry, NodeSnapshot, Outcome,
    OutcomeSource, ReconcileSummary,
};
