//! Payloads of the Ollama status endpoints the fleet reads.
//!
//! Only the fields the gateway and exporter use are modelled; everything is
//! defaulted so older or newer Ollama versions still parse.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Path probed by the health monitor and scraped by the exporter.
pub const TAGS_PATH: &str = "/api/tags";
/// Path listing the models currently loaded in memory.
pub const PS_PATH: &str = "/api/ps";

/// Response from `GET /api/tags`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagsResponse {
    #[serde(default)]
    pub models: Vec<TagModel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagModel {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified_at: Option<String>,
    #[serde(default)]
    pub details: Option<ModelDetails>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelDetails {
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub parameter_size: Option<String>,
    #[serde(default)]
    pub quantization_level: Option<String>,
}

/// Response from `GET /api/ps`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PsResponse {
    #[serde(default)]
    pub models: Vec<RunningModel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningModel {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub size_vram: u64,
    #[serde(default)]
    pub expires_at: Option<String>,
}

impl TagsResponse {
    /// Model names with their tag stripped, deduplicated.
    pub fn model_names(&self) -> BTreeSet<String> {
        self.models
            .iter()
            .map(|m| strip_tag(&m.name).to_string())
            .filter(|name| !name.is_empty())
            .collect()
    }
}

/// `llama3:8b-instruct` -> `llama3`.
pub fn strip_tag(model: &str) -> &str {
    model.split(':').next().unwrap_or(model).trim()
}
