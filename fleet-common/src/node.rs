//! Node descriptors and health states.
//!
//! Both the gateway and the exporter read the same `nodes` list from
//! configuration. Each entry is validated on its own so that one malformed
//! node never takes the rest of the fleet down with it.

use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fmt;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

/// Default port of an Ollama server.
pub const DEFAULT_OLLAMA_PORT: u16 = 11434;

/// Health state of a backend node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    /// Declared but not yet confirmed by a probe.
    #[default]
    Unknown,
    /// Responding normally.
    Healthy,
    /// Responding, but recent outcomes were failed or slow.
    Degraded,
    /// Excluded from selection until a reinstatement probe succeeds.
    Unreachable,
}

impl NodeHealth {
    pub const ALL: [NodeHealth; 4] = [
        NodeHealth::Unknown,
        NodeHealth::Healthy,
        NodeHealth::Degraded,
        NodeHealth::Unreachable,
    ];

    /// Whether a node in this state may be picked by the scheduler.
    pub fn is_eligible(&self) -> bool {
        !matches!(self, NodeHealth::Unreachable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeHealth::Unknown => "unknown",
            NodeHealth::Healthy => "healthy",
            NodeHealth::Degraded => "degraded",
            NodeHealth::Unreachable => "unreachable",
        }
    }
}

impl fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Range of model sizes (in billions of parameters) a node can serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRange {
    #[serde(default)]
    pub min_params_b: u32,
    /// No upper bound when absent.
    #[serde(default)]
    pub max_params_b: Option<u32>,
}

impl ModelRange {
    pub fn contains(&self, size_b: u32) -> bool {
        size_b >= self.min_params_b && self.max_params_b.map_or(true, |max| size_b <= max)
    }
}

/// A validated node declaration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeDescriptor {
    /// Unique node identifier (e.g. "node1").
    pub id: String,
    /// Host name or IP address.
    pub address: String,
    pub port: u16,
    /// Explicit base URL for external nodes; overrides `address`/`port`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Extra headers sent with every probe and forwarded request.
    #[serde(skip_serializing)]
    pub headers: BTreeMap<String, String>,
    /// Weight for weighted round-robin.
    pub weight: f64,
    /// Model sizes this node accepts. Empty means any size.
    pub supported_model_ranges: Vec<ModelRange>,
}

impl NodeDescriptor {
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
            base_url: None,
            api_key: None,
            headers: BTreeMap::new(),
            weight: 1.0,
            supported_model_ranges: vec![],
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_model_range(mut self, min_params_b: u32, max_params_b: Option<u32>) -> Self {
        self.supported_model_ranges.push(ModelRange {
            min_params_b,
            max_params_b,
        });
        self
    }

    /// Base URL requests to this node are built from, without a trailing slash.
    pub fn base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.address, self.port),
        }
    }

    /// Headers to attach to every outbound request to this node.
    ///
    /// The API key becomes a bearer token unless an `Authorization` header
    /// is configured explicitly.
    pub fn request_headers(&self) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            let has_auth = headers
                .iter()
                .any(|(k, _)| k.eq_ignore_ascii_case("authorization"));
            if !has_auth {
                headers.push(("Authorization".to_string(), format!("Bearer {}", key)));
            }
        }

        headers
    }

    /// Whether this node's hardware accepts a model of the given size.
    pub fn supports_size(&self, size_b: u32) -> bool {
        self.supported_model_ranges.is_empty()
            || self.supported_model_ranges.iter().any(|r| r.contains(size_b))
    }
}

/// Why a single node entry was rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DescriptorError {
    #[error("Node entry #{index} is malformed: {reason}")]
    Malformed { index: usize, reason: String },
    #[error("Node entry #{index} has no identifier")]
    MissingId { index: usize },
    #[error("Node '{id}' has no address or base_url")]
    MissingAddress { id: String },
    #[error("Node '{id}' has invalid port 0")]
    InvalidPort { id: String },
    #[error("Node '{id}' has invalid base_url '{url}'")]
    InvalidBaseUrl { id: String, url: String },
    #[error("Node '{id}' has non-positive weight {weight}")]
    InvalidWeight { id: String, weight: f64 },
    #[error("Node '{id}' has an empty model range ({min}B > {max}B)")]
    InvalidRange { id: String, min: u32, max: u32 },
    #[error("Node '{id}' is declared more than once")]
    DuplicateId { id: String },
}

/// Node entry as written in configuration, before validation.
#[derive(Debug, Deserialize)]
struct RawNodeDescriptor {
    #[serde(default, alias = "name")]
    id: Option<String>,
    #[serde(default, alias = "host")]
    address: Option<String>,
    /// Legacy form: list of host aliases, the first one is used.
    #[serde(default)]
    hosts: Vec<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default, alias = "api_url")]
    base_url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    weight: Option<f64>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    supported_model_ranges: Vec<ModelRange>,
}

fn default_true() -> bool {
    true
}

/// Result of validating a `nodes` list.
#[derive(Debug, Default)]
pub struct ParsedNodes {
    /// Valid, enabled nodes in declaration order.
    pub nodes: Vec<NodeDescriptor>,
    /// Entries rejected by validation.
    pub rejected: Vec<DescriptorError>,
    /// Identifiers of valid entries with `enabled = false`.
    pub disabled: Vec<String>,
}

fn env_reference() -> &'static Regex {
    static ENV_REFERENCE: OnceLock<Regex> = OnceLock::new();
    ENV_REFERENCE.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("valid env reference regex"))
}

/// Replace `${VAR}` references in every string of `value` with the
/// variable's contents. References to unset variables are kept as written.
pub fn resolve_env(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(text) => {
            if text.contains("${") {
                let resolved = env_reference().replace_all(text, |caps: &Captures| {
                    env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
                });
                *text = resolved.into_owned();
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(resolve_env),
        serde_json::Value::Object(fields) => fields.values_mut().for_each(resolve_env),
        _ => {}
    }
}

/// Validate every entry of a `nodes` list independently.
///
/// `${VAR}` references are resolved before validation, so secrets such as
/// `api_key` can stay out of the file.
pub fn parse_descriptors(entries: &[serde_json::Value]) -> ParsedNodes {
    let mut parsed = ParsedNodes::default();
    let mut seen = HashSet::new();

    for (index, entry) in entries.iter().enumerate() {
        let mut entry = entry.clone();
        resolve_env(&mut entry);
        let raw: RawNodeDescriptor = match serde_json::from_value(entry) {
            Ok(raw) => raw,
            Err(e) => {
                parsed.rejected.push(DescriptorError::Malformed {
                    index,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let (descriptor, enabled) = match validate(index, raw) {
            Ok(valid) => valid,
            Err(e) => {
                parsed.rejected.push(e);
                continue;
            }
        };

        if !seen.insert(descriptor.id.clone()) {
            parsed.rejected.push(DescriptorError::DuplicateId { id: descriptor.id });
            continue;
        }

        if enabled {
            parsed.nodes.push(descriptor);
        } else {
            parsed.disabled.push(descriptor.id);
        }
    }

    parsed
}

fn validate(index: usize, raw: RawNodeDescriptor) -> Result<(NodeDescriptor, bool), DescriptorError> {
    let id = raw
        .id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or(DescriptorError::MissingId { index })?;

    let base_url = raw.base_url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty());
    if let Some(url) = &base_url {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(DescriptorError::InvalidBaseUrl {
                id,
                url: url.clone(),
            });
        }
    }

    let address = raw
        .address
        .or_else(|| raw.hosts.into_iter().next())
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty());
    let address = match (address, &base_url) {
        (Some(address), _) => address,
        (None, Some(_)) => String::new(),
        (None, None) => return Err(DescriptorError::MissingAddress { id }),
    };

    let port = raw.port.unwrap_or(DEFAULT_OLLAMA_PORT);
    if port == 0 {
        return Err(DescriptorError::InvalidPort { id });
    }

    let weight = raw.weight.unwrap_or(1.0);
    if !(weight > 0.0 && weight.is_finite()) {
        return Err(DescriptorError::InvalidWeight { id, weight });
    }

    for range in &raw.supported_model_ranges {
        if let Some(max) = range.max_params_b {
            if range.min_params_b > max {
                return Err(DescriptorError::InvalidRange {
                    id,
                    min: range.min_params_b,
                    max,
                });
            }
        }
    }

    let descriptor = NodeDescriptor {
        id,
        address,
        port,
        base_url,
        api_key: raw.api_key,
        headers: raw.headers,
        weight,
        supported_model_ranges: raw.supported_model_ranges,
    };
    Ok((descriptor, raw.enabled))
}
