//! Configuration for the exporter.

use std::env;
use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use ollama_fleet_common::{parse_descriptors, HealthThresholds, ParsedNodes};
use serde::Deserialize;

/// Main configuration structure for the exporter.
///
/// Reads the same node config file as the gateway; sections the exporter
/// does not know about are ignored.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub exporter: ExporterConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    /// Thresholds for the health state mirrored from scrape outcomes.
    #[serde(default)]
    pub health: HealthThresholds,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub nodes: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_scrape_timeout")]
    pub scrape_timeout_secs: u64,
    /// Cached metrics older than this are flagged stale.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            scrape_timeout_secs: default_scrape_timeout(),
            stale_after_secs: default_stale_after(),
        }
    }
}

impl CollectorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn scrape_timeout(&self) -> Duration {
        Duration::from_secs(self.scrape_timeout_secs.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// TCP connection gauge for the Ollama server on this host.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LocalConfig {
    /// Local port to watch; the gauge is off when unset.
    #[serde(default)]
    pub port: Option<u16>,
    /// Value of the `node` label on the local gauges.
    #[serde(default)]
    pub node_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    9101
}
fn default_poll_interval() -> u64 {
    15
}
fn default_scrape_timeout() -> u64 {
    5
}
fn default_stale_after() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Path of the node config file, from `NODE_CONFIG_FILE`.
    pub fn config_path() -> String {
        env::var("NODE_CONFIG_FILE").unwrap_or_else(|_| "config/node_config".to_string())
    }

    /// Load configuration from the default path.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. `EXPORTER_PORT`, `NODE_NAME` and `OLLAMA_PORT`
    /// 2. Environment variables (EXPORTER__SECTION__KEY format)
    /// 3. The node config file (if present)
    /// 4. Built-in defaults
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("exporter.host", default_host())?
            .set_default("exporter.port", default_port() as i64)?
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("EXPORTER")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("exporter.port", env::var("EXPORTER_PORT").ok())?
            .set_override_option("local.node_name", env::var("NODE_NAME").ok())?
            .set_override_option("local.port", env::var("OLLAMA_PORT").ok())?
            .build()?;

        config.try_deserialize()
    }

    /// Validate the node list. Rejected entries are logged and skipped.
    pub fn parse_nodes(&self) -> ParsedNodes {
        let parsed = parse_descriptors(&self.nodes);
        for err in &parsed.rejected {
            tracing::warn!("Skipping node entry: {}", err);
        }
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.exporter.port, 9101);
        assert_eq!(config.collector.poll_interval(), Duration::from_secs(15));
        assert_eq!(config.collector.scrape_timeout(), Duration::from_secs(5));
        assert_eq!(config.collector.stale_after(), Duration::from_secs(60));
        assert!(config.local.port.is_none());
    }

    #[test]
    fn test_reads_gateway_node_file() {
        let file = write_config(
            r#"
[scheduling]
strategy = "least_load"

[collector]
poll_interval_secs = 2

[local]
port = 11434
node_name = "gpu-box"

[[nodes]]
id = "gpu-1"
address = "10.0.0.5"

[[nodes]]
id = "broken"
"#,
        );

        let config = Config::load_from(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.collector.poll_interval_secs, 2);
        assert_eq!(config.local.port, Some(11434));
        assert_eq!(config.local.node_name.as_deref(), Some("gpu-box"));

        let parsed = config.parse_nodes();
        assert_eq!(parsed.nodes.len(), 1);
        assert_eq!(parsed.rejected.len(), 1);
    }
}
