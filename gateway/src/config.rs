//! Configuration for the gateway.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use ollama_fleet_common::{parse_descriptors, HealthThresholds, ParsedNodes};
use serde::Deserialize;

use crate::scheduler::Strategy;

/// Config file used when `NODE_CONFIG_FILE` is not set. Any extension the
/// `config` crate understands is accepted.
pub const DEFAULT_CONFIG_FILE: &str = "config/node_config";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Raw node entries, validated one by one with [`parse_descriptors`].
    #[serde(default)]
    pub nodes: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulingConfig {
    #[serde(default)]
    pub strategy: Strategy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Upper bound of the random delay before each probe.
    #[serde(default = "default_probe_jitter")]
    pub probe_jitter_ms: u64,
    #[serde(default = "default_degrade_after")]
    pub degrade_after: u32,
    #[serde(default = "default_recover_after")]
    pub recover_after: u32,
    #[serde(default = "default_unreachable_after")]
    pub unreachable_after: u32,
    /// Successful dispatches slower than this count as trouble.
    #[serde(default)]
    pub slow_threshold_ms: Option<u64>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            probe_timeout_secs: default_probe_timeout(),
            probe_jitter_ms: default_probe_jitter(),
            degrade_after: default_degrade_after(),
            recover_after: default_recover_after(),
            unreachable_after: default_unreachable_after(),
            slow_threshold_ms: None,
        }
    }
}

impl HealthConfig {
    pub fn thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            degrade_after: self.degrade_after,
            recover_after: self.recover_after,
            unreachable_after: self.unreachable_after,
            slow_threshold_ms: self.slow_threshold_ms,
        }
        .normalized()
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    pub fn probe_jitter(&self) -> Duration {
        Duration::from_millis(self.probe_jitter_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Distinct nodes tried per request.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Overall budget of one request across all attempts.
    #[serde(default = "default_request_deadline")]
    pub request_deadline_secs: u64,
    /// Extra selection rounds when no node is eligible at all.
    #[serde(default)]
    pub unavailable_retries: u32,
    #[serde(default = "default_unavailable_backoff")]
    pub unavailable_backoff_ms: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            attempt_timeout_secs: default_attempt_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            request_deadline_secs: default_request_deadline(),
            unavailable_retries: 0,
            unavailable_backoff_ms: default_unavailable_backoff(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl DispatchConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_secs.max(1))
    }

    pub fn unavailable_backoff(&self) -> Duration {
        Duration::from_millis(self.unavailable_backoff_ms)
    }
}

/// Model-aware routing settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_model_size")]
    pub default_model_size_b: u32,
    /// Exact model name -> size in billions of parameters.
    #[serde(default)]
    pub model_name_mapping: HashMap<String, u32>,
    /// Name substring -> size, larger sizes matched first.
    #[serde(default)]
    pub model_name_patterns: HashMap<String, u32>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_model_size_b: default_model_size(),
            model_name_mapping: HashMap::new(),
            model_name_patterns: HashMap::new(),
        }
    }
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
    11435
}
fn default_probe_interval() -> u64 {
    30
}
fn default_probe_timeout() -> u64 {
    5
}
fn default_probe_jitter() -> u64 {
    1000
}
fn default_degrade_after() -> u32 {
    2
}
fn default_recover_after() -> u32 {
    2
}
fn default_unreachable_after() -> u32 {
    3
}
fn default_max_attempts() -> u32 {
    3
}
fn default_attempt_timeout() -> u64 {
    300
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_request_deadline() -> u64 {
    600
}
fn default_unavailable_backoff() -> u64 {
    500
}
fn default_max_body_bytes() -> usize {
    64 * 1024 * 1024
}
fn default_true() -> bool {
    true
}
fn default_model_size() -> u32 {
    7
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Path of the node config file, from `NODE_CONFIG_FILE` or the default.
    pub fn config_path() -> String {
        env::var("NODE_CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string())
    }

    /// Load configuration from the node config file and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration using `path` as the node config file.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. `GATEWAY_PORT` / `SCHEDULING_STRATEGY`
    /// 2. Environment variables (GATEWAY__SECTION__KEY format)
    /// 3. The config file, if present
    /// 4. Built-in defaults
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port() as i64)?
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("GATEWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("server.port", env::var("GATEWAY_PORT").ok())?
            .set_override_option("scheduling.strategy", env::var("SCHEDULING_STRATEGY").ok())?
            .build()?;

        config.try_deserialize()
    }

    /// Validate the node list. Rejected entries are logged and skipped.
    pub fn parse_nodes(&self) -> ParsedNodes {
        let parsed = parse_descriptors(&self.nodes);
        for err in &parsed.rejected {
            tracing::warn!("Skipping node entry: {}", err);
        }
        for id in &parsed.disabled {
            tracing::info!("Node {} is disabled", id);
        }
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let health = HealthConfig::default();
        assert_eq!(health.probe_interval(), Duration::from_secs(30));
        assert_eq!(health.probe_timeout(), Duration::from_secs(5));
        assert_eq!(health.thresholds(), HealthThresholds::default());

        let dispatch = DispatchConfig::default();
        assert_eq!(dispatch.max_attempts, 3);
        assert_eq!(dispatch.attempt_timeout(), Duration::from_secs(300));
        assert_eq!(dispatch.connect_timeout(), Duration::from_secs(10));

        assert_eq!(ServerConfig::default().port, 11435);
        assert_eq!(RoutingConfig::default().default_model_size_b, 7);
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
[scheduling]
strategy = "least_connections"

[health]
unreachable_after = 5

[routing.model_name_mapping]
"deepseek-r1" = 671

[[nodes]]
name = "gpu-1"
hosts = ["10.0.0.5"]
port = 11434

[[nodes]]
name = "cloud"
api_url = "https://ollama.example.com"
api_key = "secret"
weight = 2.5
"#,
        );

        let config = Config::load_from(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.scheduling.strategy, Strategy::LeastLoad);
        assert_eq!(config.health.thresholds().unreachable_after, 5);
        assert_eq!(config.routing.model_name_mapping.get("deepseek-r1"), Some(&671));

        let parsed = config.parse_nodes();
        assert!(parsed.rejected.is_empty());
        assert_eq!(parsed.nodes.len(), 2);
        assert_eq!(parsed.nodes[0].base_url(), "http://10.0.0.5:11434");
        assert_eq!(parsed.nodes[1].base_url(), "https://ollama.example.com");
        assert_eq!(parsed.nodes[1].weight, 2.5);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load_from("/nonexistent/node_config").unwrap();
        assert!(config.nodes.is_empty());
        assert_eq!(config.scheduling.strategy, Strategy::RoundRobin);
        assert_eq!(config.logging.level, "info");
    }
}
