//! Node selection strategies.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use ollama_fleet_common::NodeSnapshot;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::context::RequestContext;

/// Strategy for selecting a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Rotate through eligible nodes.
    #[default]
    RoundRobin,
    /// Fewest in-flight requests, then lowest failure rate.
    #[serde(alias = "least_connections")]
    LeastLoad,
    /// Smooth weighted rotation using node weights.
    WeightedRoundRobin,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastLoad => "least_load",
            Strategy::WeightedRoundRobin => "weighted_round_robin",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" => Ok(Strategy::RoundRobin),
            "least_load" | "least_connections" => Ok(Strategy::LeastLoad),
            "weighted_round_robin" => Ok(Strategy::WeightedRoundRobin),
            other => Err(format!("unknown scheduling strategy: {}", other)),
        }
    }
}

/// Picks one node per attempt.
///
/// Selection never blocks on I/O. The round-robin cursor is shared by all
/// requests, so concurrent callers each get a distinct cursor value.
pub struct Scheduler {
    strategy: Strategy,
    cursor: AtomicUsize,
    /// Current weights for smooth weighted round-robin, keyed by node id.
    weights: Mutex<HashMap<String, f64>>,
}

impl Scheduler {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
            weights: Mutex::new(HashMap::new()),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Select a node from `candidates`, skipping nodes `ctx` already tried.
    ///
    /// Returns `None` when every candidate was tried or there are none.
    pub fn select(&self, candidates: &[NodeSnapshot], ctx: &RequestContext) -> Option<NodeSnapshot> {
        if candidates.is_empty() || candidates.iter().all(|n| ctx.has_tried(&n.id)) {
            return None;
        }

        match self.strategy {
            Strategy::RoundRobin => self.round_robin(candidates, ctx),
            Strategy::LeastLoad => least_load(candidates, ctx),
            Strategy::WeightedRoundRobin => self.weighted(candidates, ctx),
        }
    }

    /// Drop weighted round-robin state for nodes no longer in `eligible`.
    ///
    /// Takes the full eligible set, not a model-filtered subset, so nodes a
    /// request did not consider keep their place in the rotation.
    pub fn retain_nodes(&self, eligible: &[NodeSnapshot]) {
        if self.strategy == Strategy::WeightedRoundRobin {
            self.weights
                .lock()
                .retain(|id, _| eligible.iter().any(|n| &n.id == id));
        }
    }

    fn round_robin(&self, candidates: &[NodeSnapshot], ctx: &RequestContext) -> Option<NodeSnapshot> {
        let n = candidates.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        (0..n)
            .map(|offset| &candidates[(start + offset) % n])
            .find(|node| !ctx.has_tried(&node.id))
            .cloned()
    }

    fn weighted(&self, candidates: &[NodeSnapshot], ctx: &RequestContext) -> Option<NodeSnapshot> {
        let mut weights = self.weights.lock();

        let open: Vec<&NodeSnapshot> = candidates.iter().filter(|n| !ctx.has_tried(&n.id)).collect();
        let total: f64 = open.iter().map(|n| n.descriptor.weight).sum();

        let mut best: Option<(&NodeSnapshot, f64)> = None;
        for node in open {
            let current = weights.entry(node.id.clone()).or_insert(0.0);
            *current += node.descriptor.weight;
            if best.map_or(true, |(_, w)| *current > w) {
                best = Some((node, *current));
            }
        }

        let (chosen, _) = best?;
        if let Some(current) = weights.get_mut(&chosen.id) {
            *current -= total;
        }
        Some(chosen.clone())
    }
}

fn least_load(candidates: &[NodeSnapshot], ctx: &RequestContext) -> Option<NodeSnapshot> {
    candidates
        .iter()
        .filter(|n| !ctx.has_tried(&n.id))
        .min_by(|a, b| {
            a.in_flight
                .cmp(&b.in_flight)
                .then_with(|| a.failure_rate().total_cmp(&b.failure_rate()))
                .then_with(|| a.id.cmp(&b.id))
        })
        .cloned()
}
