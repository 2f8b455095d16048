//! Metrics collection from the fleet's Ollama nodes.
//!
//! Every `poll_interval` each node in the registry, unreachable ones included,
//! is scraped in parallel (`/api/ps` and `/api/tags`). The result lands in a
//! per-node cache that the HTTP handlers read; handlers never trigger a live
//! fetch. A failed scrape keeps the node's last good metrics and only marks
//! its entry with the error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use ollama_fleet_common::ollama::{PS_PATH, TAGS_PATH};
use ollama_fleet_common::{NodeHealth, NodeRegistry, NodeSnapshot, Outcome, PsResponse, TagsResponse};
use parking_lot::RwLock;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::CollectorConfig;
use crate::error::{Error, Result};
use crate::local::{LocalConnections, LocalSample};

/// A model currently loaded on a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadedModel {
    pub name: String,
    pub size_bytes: u64,
    pub vram_bytes: u64,
    pub expires_at: Option<String>,
}

/// Normalized status of one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeMetrics {
    pub loaded_models: Vec<LoadedModel>,
    pub available_models: usize,
    pub latency_ms: u64,
}

impl NodeMetrics {
    fn from_status(ps: PsResponse, tags: &TagsResponse, latency: Duration) -> Self {
        Self {
            loaded_models: ps
                .models
                .into_iter()
                .map(|m| LoadedModel {
                    name: m.name,
                    size_bytes: m.size,
                    vram_bytes: m.size_vram,
                    expires_at: m.expires_at,
                })
                .collect(),
            available_models: tags.models.len(),
            latency_ms: latency.as_millis() as u64,
        }
    }

    pub fn vram_bytes(&self) -> u64 {
        self.loaded_models.iter().map(|m| m.vram_bytes).sum()
    }

    pub fn size_bytes(&self) -> u64 {
        self.loaded_models.iter().map(|m| m.size_bytes).sum()
    }
}

#[derive(Debug, Default)]
struct ScrapeEntry {
    metrics: Option<NodeMetrics>,
    last_success: Option<DateTime<Utc>>,
    last_attempt: Option<DateTime<Utc>>,
    last_error: Option<String>,
    scrapes: u64,
    failures: u64,
}

/// What the cache holds for one node, as served by `/snapshot`.
#[derive(Debug, Clone, Serialize)]
pub struct CachedNode {
    pub id: String,
    pub base_url: String,
    pub health: NodeHealth,
    pub metrics: Option<NodeMetrics>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Seconds since the cached metrics were fetched.
    pub age_seconds: Option<f64>,
    /// No metrics yet, the last scrape failed, or the metrics are too old.
    pub stale: bool,
    pub scrapes: u64,
    pub failures: u64,
}

/// Everything the metrics endpoint renders.
#[derive(Debug, Clone, Serialize)]
pub struct CollectorSnapshot {
    pub nodes: Vec<CachedNode>,
    pub local: Option<LocalView>,
    pub last_poll: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalView {
    pub node: String,
    pub port: u16,
    #[serde(flatten)]
    pub sample: LocalSample,
}

pub struct MetricsCollector {
    registry: Arc<NodeRegistry>,
    client: Client,
    cache: RwLock<HashMap<String, ScrapeEntry>>,
    local: Option<LocalConnections>,
    last_poll: RwLock<Option<DateTime<Utc>>>,
    poll_interval: Duration,
    scrape_timeout: Duration,
    stale_after: Duration,
}

impl MetricsCollector {
    pub fn new(
        registry: Arc<NodeRegistry>,
        client: Client,
        config: &CollectorConfig,
        local: Option<LocalConnections>,
    ) -> Self {
        Self {
            registry,
            client,
            cache: RwLock::new(HashMap::new()),
            local,
            last_poll: RwLock::new(None),
            poll_interval: config.poll_interval(),
            scrape_timeout: config.scrape_timeout(),
            stale_after: config.stale_after(),
        }
    }

    /// Starts the polling task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                "Collector started: interval={:?}, timeout={:?}",
                self.poll_interval,
                self.scrape_timeout
            );
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.poll_once().await;
            }
        })
    }

    /// Whether local connections are watched, which is worth exporting
    /// even without nodes.
    pub fn watches_local(&self) -> bool {
        self.local.is_some()
    }

    /// Scrape every node once and refresh the local gauge.
    pub async fn poll_once(&self) {
        let nodes = self.registry.all();
        self.prune(&nodes);

        let scrapes = nodes.into_iter().map(|node| async move {
            let start = Instant::now();
            let result = self.scrape(&node).await;
            (node, result, start.elapsed())
        });
        let results = join_all(scrapes).await;

        for (node, result, latency) in results {
            self.record(&node, result, latency);
        }

        if let Some(local) = &self.local {
            local.refresh().await;
        }
        *self.last_poll.write() = Some(Utc::now());
    }

    async fn scrape(&self, node: &NodeSnapshot) -> Result<(PsResponse, TagsResponse)> {
        let fetch = async {
            tokio::try_join!(
                self.fetch::<PsResponse>(node, PS_PATH),
                self.fetch::<TagsResponse>(node, TAGS_PATH)
            )
        };

        tokio::time::timeout(self.scrape_timeout, fetch)
            .await
            .map_err(|_| Error::ScrapeTimeout {
                node: node.id.clone(),
                timeout: self.scrape_timeout,
            })?
    }

    async fn fetch<T: DeserializeOwned>(&self, node: &NodeSnapshot, path: &str) -> Result<T> {
        let url = format!("{}{}", node.base_url(), path);
        let mut request = self.client.get(&url);
        for (name, value) in node.descriptor.request_headers() {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::scrape(&node.id, e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::scrape(
                &node.id,
                format!("{} returned {}", path, response.status()),
            ));
        }

        response
            .json()
            .await
            .map_err(|e| Error::scrape(&node.id, format!("invalid {} response: {}", path, e)))
    }

    fn record(&self, node: &NodeSnapshot, result: Result<(PsResponse, TagsResponse)>, latency: Duration) {
        let now = Utc::now();
        let (outcome, models) = {
            let mut cache = self.cache.write();
            let entry = cache.entry(node.id.clone()).or_default();
            entry.scrapes += 1;
            entry.last_attempt = Some(now);

            match result {
                Ok((ps, tags)) => {
                    let models = tags.model_names();
                    entry.metrics = Some(NodeMetrics::from_status(ps, &tags, latency));
                    entry.last_success = Some(now);
                    entry.last_error = None;
                    (Outcome::probe_ok(latency), Some(models))
                }
                Err(e) => {
                    tracing::warn!("{}", e);
                    entry.failures += 1;
                    entry.last_error = Some(e.to_string());
                    (Outcome::probe_failed(latency, e.to_string()), None)
                }
            }
        };

        // The cache lock is released before the registry is touched.
        if let Some(models) = models {
            self.registry.update_models(&node.id, models);
        }
        self.registry.report_outcome(&node.id, outcome);
    }

    /// Drop cache entries of nodes no longer in the registry.
    fn prune(&self, nodes: &[NodeSnapshot]) {
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|id, _| nodes.iter().any(|n| &n.id == id));
        if cache.len() < before {
            tracing::debug!("Pruned {} cache entries", before - cache.len());
        }
    }

    /// The cached state of every node, in registry order.
    pub fn snapshot(&self) -> CollectorSnapshot {
        let nodes = self.registry.all();
        let now = Utc::now();
        let cache = self.cache.read();

        let nodes = nodes
            .into_iter()
            .map(|node| {
                let entry = cache.get(&node.id);
                let last_success = entry.and_then(|e| e.last_success);
                let age_seconds =
                    last_success.map(|t| (now - t).num_milliseconds().max(0) as f64 / 1000.0);
                let last_error = entry.and_then(|e| e.last_error.clone());
                let too_old = age_seconds.map_or(true, |age| age > self.stale_after.as_secs_f64());

                CachedNode {
                    base_url: node.base_url(),
                    health: node.health,
                    metrics: entry.and_then(|e| e.metrics.clone()),
                    last_success,
                    last_attempt: entry.and_then(|e| e.last_attempt),
                    stale: last_error.is_some() || too_old,
                    last_error,
                    age_seconds,
                    scrapes: entry.map_or(0, |e| e.scrapes),
                    failures: entry.map_or(0, |e| e.failures),
                    id: node.id,
                }
            })
            .collect();

        CollectorSnapshot {
            nodes,
            local: self.local.as_ref().and_then(|local| {
                local.sample().map(|sample| LocalView {
                    node: local.node_name().to_string(),
                    port: local.port(),
                    sample,
                })
            }),
            last_poll: *self.last_poll.read(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ollama_fleet_common::{HealthThresholds, NodeDescriptor};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn ollama_node(loaded: &[(&str, u64)]) -> MockServer {
        let server = MockServer::start().await;
        let models: Vec<_> = loaded
            .iter()
            .map(|(name, vram)| json!({ "name": name, "size": vram * 2, "size_vram": vram }))
            .collect();
        Mock::given(method("GET"))
            .and(path("/api/ps"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "models": models })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{ "name": "llama3:8b" }, { "name": "phi3:mini" }]
            })))
            .mount(&server)
            .await;
        server
    }

    fn collector(nodes: &[(&str, &MockServer)]) -> (Arc<NodeRegistry>, MetricsCollector) {
        let registry = Arc::new(NodeRegistry::from_descriptors(
            nodes
                .iter()
                .map(|(id, server)| NodeDescriptor::new(*id, "127.0.0.1", 1).with_base_url(server.uri()))
                .collect(),
            HealthThresholds::default(),
        ));
        let config = CollectorConfig {
            scrape_timeout_secs: 1,
            ..Default::default()
        };
        let collector = MetricsCollector::new(registry.clone(), Client::new(), &config, None);
        (registry, collector)
    }

    #[tokio::test]
    async fn test_poll_normalizes_node_status() {
        let a = ollama_node(&[("llama3:8b", 4_000)]).await;
        let (registry, collector) = collector(&[("a", &a)]);

        assert!(collector.snapshot().nodes[0].stale);
        collector.poll_once().await;

        let snapshot = collector.snapshot();
        let node = &snapshot.nodes[0];
        assert!(!node.stale);
        assert_eq!(node.scrapes, 1);
        let metrics = node.metrics.as_ref().unwrap();
        assert_eq!(metrics.loaded_models[0].name, "llama3:8b");
        assert_eq!(metrics.vram_bytes(), 4_000);
        assert_eq!(metrics.size_bytes(), 8_000);
        assert_eq!(metrics.available_models, 2);
        assert!(snapshot.last_poll.is_some());

        let a = registry.get("a").unwrap();
        assert_eq!(a.health, NodeHealth::Healthy);
        assert!(a.has_model("phi3"));
    }

    #[tokio::test]
    async fn test_failed_scrape_keeps_last_good_metrics() {
        let a = ollama_node(&[("llama3:8b", 4_000)]).await;
        let (registry, collector) = collector(&[("a", &a)]);
        collector.poll_once().await;

        a.reset().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&a)
            .await;
        collector.poll_once().await;

        let node = &collector.snapshot().nodes[0];
        assert!(node.stale);
        assert_eq!(node.failures, 1);
        assert!(node.last_error.as_ref().unwrap().contains("500"));
        assert_eq!(node.metrics.as_ref().unwrap().vram_bytes(), 4_000);
        assert_eq!(registry.get("a").unwrap().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_slow_node_does_not_affect_others() {
        let a = ollama_node(&[("llama3:8b", 1)]).await;
        let b = ollama_node(&[]).await;
        let c = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "models": [] }))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&c)
            .await;
        let (_registry, collector) = collector(&[("a", &a), ("b", &b), ("c", &c)]);

        let start = Instant::now();
        collector.poll_once().await;
        assert!(start.elapsed() < Duration::from_secs(4));

        let snapshot = collector.snapshot();
        let by_id = |id: &str| snapshot.nodes.iter().find(|n| n.id == id).unwrap().clone();
        assert!(!by_id("a").stale);
        assert!(!by_id("b").stale);
        let c = by_id("c");
        assert!(c.stale);
        assert!(c.metrics.is_none());
        assert!(c.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_snapshots_run_alongside_polls() {
        let a = ollama_node(&[("llama3:8b", 1)]).await;
        let b = ollama_node(&[("phi3:mini", 2)]).await;
        let (registry, collector) = collector(&[("a", &a), ("b", &b)]);
        let collector = Arc::new(collector);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let collector = collector.clone();
                let registry = registry.clone();
                tokio::spawn(async move {
                    for _ in 0..200 {
                        let snapshot = collector.snapshot();
                        assert_eq!(snapshot.nodes.len(), 2);
                        registry.snapshot();
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        let polls = async {
            for _ in 0..5 {
                collector.poll_once().await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), polls).await.unwrap();
        for reader in readers {
            tokio::time::timeout(Duration::from_secs(10), reader)
                .await
                .unwrap()
                .unwrap();
        }

        assert!(registry.get("b").unwrap().has_model("phi3"));
        assert_eq!(collector.snapshot().nodes[1].scrapes, 5);
    }

    #[tokio::test]
    async fn test_removed_nodes_are_pruned() {
        let a = ollama_node(&[]).await;
        let b = ollama_node(&[]).await;
        let (registry, collector) = collector(&[("a", &a), ("b", &b)]);
        collector.poll_once().await;
        assert_eq!(collector.cache.read().len(), 2);

        registry.reconcile(vec![NodeDescriptor::new("a", "127.0.0.1", 1).with_base_url(a.uri())]);
        collector.poll_once().await;

        assert_eq!(collector.cache.read().len(), 1);
        assert_eq!(collector.snapshot().nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_nodes_are_still_scraped() {
        let a = ollama_node(&[]).await;
        let (registry, collector) = collector(&[("a", &a)]);
        registry.set_health("a", NodeHealth::Unreachable);

        collector.poll_once().await;

        assert_eq!(a.received_requests().await.unwrap().len(), 2);
        assert_eq!(registry.get("a").unwrap().health, NodeHealth::Unknown);
    }
}
