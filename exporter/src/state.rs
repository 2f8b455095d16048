//! Shared application state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ollama_fleet_common::NodeRegistry;
use reqwest::Client;

use crate::collector::MetricsCollector;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::local::LocalConnections;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub registry: Arc<NodeRegistry>,
    pub collector: Arc<MetricsCollector>,
    /// Node file re-read by `POST /api/config/reload`.
    pub config_path: String,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Build the exporter from configuration.
    ///
    /// Needs at least one valid node or a local port to watch. The collector
    /// is not started; call [`MetricsCollector::spawn`] on it.
    pub fn build(config: &Config, config_path: impl Into<String>) -> Result<Arc<Self>> {
        let parsed = config.parse_nodes();
        if parsed.nodes.is_empty() && config.local.port.is_none() {
            return Err(Error::Configuration(format!(
                "nothing to export: no valid nodes ({} rejected) and no local port",
                parsed.rejected.len()
            )));
        }

        let registry = Arc::new(NodeRegistry::from_descriptors(parsed.nodes, config.health));

        let client = Client::builder()
            .connect_timeout(config.collector.scrape_timeout())
            .build()
            .map_err(|e| Error::Internal(format!("failed to create HTTP client: {}", e)))?;

        let local = config.local.port.map(|port| {
            let name = config
                .local
                .node_name
                .clone()
                .unwrap_or_else(|| "localhost".to_string());
            LocalConnections::new(port, name)
        });

        let collector = Arc::new(MetricsCollector::new(
            registry.clone(),
            client,
            &config.collector,
            local,
        ));

        Ok(Arc::new(Self {
            registry,
            collector,
            config_path: config_path.into(),
            started_at: Utc::now(),
        }))
    }
}
