//! Model-aware candidate filtering.
//!
//! Requests naming a model are steered toward nodes that already have it and
//! whose configured size ranges admit it. When no node qualifies, all
//! eligible nodes stay candidates so that a node can still pull the model on
//! demand.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use axum::extract::Query;
use axum::http::Uri;
use ollama_fleet_common::{strip_tag, NodeSnapshot};
use regex::Regex;
use serde::Serialize;

use crate::config::RoutingConfig;

/// `30b`, `70B`, `8-b`, `13_b` ...
fn size_token() -> &'static Regex {
    static SIZE_TOKEN: OnceLock<Regex> = OnceLock::new();
    SIZE_TOKEN.get_or_init(|| Regex::new(r"(\d+)\s*[-_]?\s*b\b").expect("valid size regex"))
}

fn find_size(text: &str) -> Option<u32> {
    size_token()
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// The model a request asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelRequirement {
    /// Name as requested, including any tag.
    pub name: String,
    /// Name with the tag stripped.
    pub base: String,
    /// Estimated size in billions of parameters.
    pub size_b: u32,
}

/// How a size estimate was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeSource {
    Tag,
    FullName,
    Mapping,
    Pattern,
    Default,
}

/// The router's effective configuration, as normalized at startup.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingRules {
    pub enabled: bool,
    pub default_model_size_b: u32,
    pub model_name_mapping: BTreeMap<String, u32>,
    /// In match order.
    pub model_name_patterns: Vec<(String, u32)>,
}

#[derive(Debug)]
pub struct ModelRouter {
    enabled: bool,
    default_size_b: u32,
    /// Keyed by lowercased model name.
    mapping: HashMap<String, u32>,
    /// Lowercased patterns, larger sizes first.
    patterns: Vec<(String, u32)>,
}

impl ModelRouter {
    pub fn new(config: &RoutingConfig) -> Self {
        let mut patterns: Vec<(String, u32)> = config
            .model_name_patterns
            .iter()
            .map(|(p, size)| (p.to_lowercase(), *size))
            .filter(|(p, _)| !p.is_empty())
            .collect();
        patterns.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.len().cmp(&a.0.len())));

        Self {
            enabled: config.enabled,
            default_size_b: config.default_model_size_b,
            mapping: config
                .model_name_mapping
                .iter()
                .map(|(name, size)| (name.to_lowercase(), *size))
                .collect(),
            patterns,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn rules(&self) -> RoutingRules {
        RoutingRules {
            enabled: self.enabled,
            default_model_size_b: self.default_size_b,
            model_name_mapping: self.mapping.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            model_name_patterns: self.patterns.clone(),
        }
    }

    /// Build the requirement for a requested model name.
    pub fn requirement(&self, model: &str) -> ModelRequirement {
        let base = strip_tag(model).to_string();
        let (size_b, _) = self.estimate_size(model);
        ModelRequirement {
            name: model.to_string(),
            base,
            size_b,
        }
    }

    /// Estimate a model's size in billions of parameters.
    pub fn estimate_size(&self, model: &str) -> (u32, SizeSource) {
        let full = model.trim();
        let base = strip_tag(full);
        if base.is_empty() {
            return (self.default_size_b, SizeSource::Default);
        }

        let full_lower = full.to_lowercase();
        if let Some((_, tag)) = full_lower.rsplit_once(':') {
            if let Some(size) = find_size(tag) {
                return (size, SizeSource::Tag);
            }
        }
        if let Some(size) = find_size(&full_lower) {
            return (size, SizeSource::FullName);
        }

        let base_lower = base.to_lowercase();
        if let Some(size) = self
            .mapping
            .get(&base_lower)
            .or_else(|| self.mapping.get(&full_lower))
        {
            return (*size, SizeSource::Mapping);
        }

        if let Some((_, size)) = self
            .patterns
            .iter()
            .find(|(pattern, _)| base_lower.contains(pattern.as_str()))
        {
            return (*size, SizeSource::Pattern);
        }

        (self.default_size_b, SizeSource::Default)
    }

    /// Patterns that match `model`, for diagnostics.
    pub fn matching_patterns(&self, model: &str) -> Vec<String> {
        let lower = model.to_lowercase();
        self.patterns
            .iter()
            .filter(|(p, _)| lower.contains(p.as_str()))
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Narrow `eligible` to nodes suited for `requirement`.
    ///
    /// Falls back to all of `eligible` when routing is disabled, no model was
    /// requested, or no node qualifies.
    pub fn candidates(
        &self,
        eligible: Vec<NodeSnapshot>,
        requirement: Option<&ModelRequirement>,
    ) -> Vec<NodeSnapshot> {
        let Some(req) = requirement.filter(|_| self.enabled) else {
            return eligible;
        };

        let suited: Vec<NodeSnapshot> = eligible
            .iter()
            .filter(|n| is_suited(n, req))
            .cloned()
            .collect();

        if suited.is_empty() {
            tracing::debug!(
                "No node has model {} ({}B), falling back to {} eligible nodes",
                req.name,
                req.size_b,
                eligible.len()
            );
            eligible
        } else {
            suited
        }
    }
}

/// Whether a node has the model and admits its size.
pub fn is_suited(node: &NodeSnapshot, req: &ModelRequirement) -> bool {
    node.has_model(&req.base) && node.descriptor.supports_size(req.size_b)
}

/// Pull the requested model out of the `model` query parameter or a JSON body.
pub fn extract_model(uri: &Uri, body: &[u8]) -> Option<String> {
    let from_query = Query::<HashMap<String, String>>::try_from_uri(uri)
        .ok()
        .and_then(|Query(mut params)| params.remove("model"))
        .filter(|m| !m.is_empty());
    if from_query.is_some() {
        return from_query;
    }

    if body.is_empty() {
        return None;
    }
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value
        .get("model")
        .and_then(|m| m.as_str())
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}
