//! Health monitor for backend nodes.
//!
//! Every `probe_interval` all configured nodes are probed in parallel with
//! `GET /api/tags`. Results go through the registry's outcome path, the same
//! one dispatch attempts use, and a successful probe also refreshes the
//! node's model list. The dispatcher can ask for an immediate re-check of a
//! single node through a [`HealthHandle`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use ollama_fleet_common::ollama::TAGS_PATH;
use ollama_fleet_common::{NodeDescriptor, NodeRegistry, NodeSnapshot, Outcome, TagsResponse};
use rand::Rng;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::HealthConfig;
use crate::error::{Error, Result};

const RECHECK_QUEUE: usize = 64;

/// What a successful probe learned about a node.
#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    pub models: BTreeSet<String>,
}

/// A synthetic health check against one node.
#[async_trait]
pub trait NodeProbe: Send + Sync {
    async fn probe(&self, node: &NodeDescriptor) -> Result<ProbeReport>;
}

/// Probes a node's `/api/tags` endpoint over HTTP.
pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeProbe for HttpProbe {
    async fn probe(&self, node: &NodeDescriptor) -> Result<ProbeReport> {
        let url = format!("{}{}", node.base_url(), TAGS_PATH);
        let mut request = self.client.get(&url);
        for (name, value) in node.request_headers() {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::ProbeFailure(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::ProbeFailure(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| Error::ProbeFailure(format!("invalid tags response: {}", e)))?;

        Ok(ProbeReport {
            models: tags.model_names(),
        })
    }
}

/// Handle for requesting an out-of-schedule probe of one node.
#[derive(Debug, Clone)]
pub struct HealthHandle {
    tx: mpsc::Sender<String>,
}

impl HealthHandle {
    /// Queue a re-check. Dropped if the queue is full or the monitor is gone.
    pub fn request_recheck(&self, node_id: &str) {
        if let Err(e) = self.tx.try_send(node_id.to_string()) {
            tracing::debug!("Re-check of {} not queued: {}", node_id, e);
        }
    }

    /// A handle with no monitor behind it.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }
}

pub struct HealthMonitor {
    probes: Prober,
    interval: Duration,
    rechecks: mpsc::Receiver<String>,
}

struct Prober {
    registry: Arc<NodeRegistry>,
    probe: Arc<dyn NodeProbe>,
    timeout: Duration,
    jitter: Duration,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        probe: Arc<dyn NodeProbe>,
        config: &HealthConfig,
    ) -> (Self, HealthHandle) {
        let (tx, rechecks) = mpsc::channel(RECHECK_QUEUE);
        let monitor = Self {
            probes: Prober {
                registry,
                probe,
                timeout: config.probe_timeout(),
                jitter: config.probe_jitter(),
            },
            interval: config.probe_interval(),
            rechecks,
        };
        (monitor, HealthHandle { tx })
    }

    /// Starts the monitor task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        let HealthMonitor {
            probes,
            interval,
            mut rechecks,
        } = self;
        tracing::info!(
            "Health monitor started: interval={:?}, timeout={:?}",
            interval,
            probes.timeout
        );
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => probes.probe_all().await,
                Some(node_id) = rechecks.recv() => probes.probe_one(&node_id).await,
            }
        }
    }

    /// Probe every configured node, unreachable ones included, in parallel.
    pub async fn probe_all(&self) {
        self.probes.probe_all().await;
    }

    /// Probe a single node right away.
    pub async fn probe_one(&self, node_id: &str) {
        self.probes.probe_one(node_id).await;
    }
}

impl Prober {
    async fn probe_all(&self) {
        let nodes = self.registry.all();
        let checks = nodes.into_iter().map(|node| {
            let delay = self.jitter_delay();
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                self.check(node).await;
            }
        });
        join_all(checks).await;
    }

    async fn probe_one(&self, node_id: &str) {
        match self.registry.get(node_id) {
            Some(node) => self.check(node).await,
            None => tracing::debug!("Skipping re-check of removed node {}", node_id),
        }
    }

    fn jitter_delay(&self) -> Duration {
        let max = self.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max))
    }

    async fn check(&self, node: NodeSnapshot) {
        let start = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.probe.probe(&node.descriptor)).await;
        let latency = start.elapsed();

        let outcome = match result {
            Ok(Ok(report)) => {
                self.registry.update_models(&node.id, report.models);
                Outcome::probe_ok(latency)
            }
            Ok(Err(e)) => {
                tracing::warn!("Probe of node {} failed: {}", node.id, e);
                Outcome::probe_failed(latency, e.to_string())
            }
            Err(_) => {
                tracing::warn!("Probe of node {} timed out after {:?}", node.id, self.timeout);
                Outcome::probe_failed(latency, format!("probe timed out after {:?}", self.timeout))
            }
        };

        self.registry.report_outcome(&node.id, outcome);
    }
}
