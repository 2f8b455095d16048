//! Node registry: the single source of truth for node health and load.
//!
//! All state lives behind one short-lived lock that is never held across
//! I/O. Callers only ever receive copied-out [`NodeSnapshot`]s; every
//! mutation goes through a registry method so that readers never observe a
//! half-applied update.
//!
//! Live traffic (dispatch) and synthetic probes feed the same counters via
//! [`NodeRegistry::report_outcome`], which also drives the health state
//! machine:
//!
//! ```text
//! Unknown --probe ok--> Healthy --failed/slow x degrade_after--> Degraded
//!    |                     ^                                        |
//!    |                     +------- ok x recover_after -------------+
//!    +--probe failed--> Unreachable <--failures x unreachable_after-+
//!                          |
//!                          +--probe ok--> Unknown
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::node::{NodeDescriptor, NodeHealth};

/// Thresholds driving health transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// Consecutive failed or slow outcomes before Healthy -> Degraded.
    #[serde(default = "default_degrade_after")]
    pub degrade_after: u32,
    /// Consecutive fast successes before Degraded -> Healthy.
    #[serde(default = "default_recover_after")]
    pub recover_after: u32,
    /// Consecutive failures before a node becomes Unreachable.
    #[serde(default = "default_unreachable_after")]
    pub unreachable_after: u32,
    /// Dispatch latency above which a success still counts as "slow".
    #[serde(default)]
    pub slow_threshold_ms: Option<u64>,
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

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degrade_after: default_degrade_after(),
            recover_after: default_recover_after(),
            unreachable_after: default_unreachable_after(),
            slow_threshold_ms: None,
        }
    }
}

impl HealthThresholds {
    /// Clamp every threshold to at least one outcome.
    pub fn normalized(self) -> Self {
        Self {
            degrade_after: self.degrade_after.max(1),
            recover_after: self.recover_after.max(1),
            unreachable_after: self.unreachable_after.max(1),
            slow_threshold_ms: self.slow_threshold_ms,
        }
    }

    fn is_slow(&self, latency: Duration) -> bool {
        self.slow_threshold_ms
            .is_some_and(|ms| latency > Duration::from_millis(ms))
    }
}

/// Where an outcome was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeSource {
    Probe,
    Dispatch,
}

/// Result of one probe or one dispatch attempt against a node.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub source: OutcomeSource,
    pub success: bool,
    pub latency: Duration,
    pub error: Option<String>,
}

impl Outcome {
    pub fn probe_ok(latency: Duration) -> Self {
        Self {
            source: OutcomeSource::Probe,
            success: true,
            latency,
            error: None,
        }
    }

    pub fn probe_failed(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            source: OutcomeSource::Probe,
            success: false,
            latency,
            error: Some(error.into()),
        }
    }

    pub fn dispatch_ok(latency: Duration) -> Self {
        Self {
            source: OutcomeSource::Dispatch,
            success: true,
            latency,
            error: None,
        }
    }

    pub fn dispatch_failed(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            source: OutcomeSource::Dispatch,
            success: false,
            latency,
            error: Some(error.into()),
        }
    }
}

/// A health state change applied by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTransition {
    pub from: NodeHealth,
    pub to: NodeHealth,
}

/// Point-in-time copy of one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub descriptor: Arc<NodeDescriptor>,
    pub health: NodeHealth,
    pub in_flight: u32,
    /// Successful dispatch attempts.
    pub successes: u64,
    /// Failed dispatch attempts.
    pub failures: u64,
    pub consecutive_failures: u32,
    pub last_probe: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_latency_ms: Option<u64>,
    /// Model names (without tag) synced from the node.
    pub models: Arc<BTreeSet<String>>,
}

impl NodeSnapshot {
    /// Fraction of dispatch attempts that failed, 0.0 when none were made.
    pub fn failure_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            0.0
        } else {
            self.failures as f64 / total as f64
        }
    }

    pub fn has_model(&self, model: &str) -> bool {
        self.models.contains(model)
    }

    pub fn base_url(&self) -> String {
        self.descriptor.base_url()
    }
}

/// Result of reconciling the registry against a new node list.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

impl ReconcileSummary {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug)]
struct NodeEntry {
    descriptor: Arc<NodeDescriptor>,
    health: NodeHealth,
    in_flight: u32,
    successes: u64,
    failures: u64,
    failure_streak: u32,
    trouble_streak: u32,
    success_streak: u32,
    last_probe: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_latency_ms: Option<u64>,
    models: Arc<BTreeSet<String>>,
    /// Removed from configuration; dropped once `in_flight` reaches zero.
    retired: bool,
}

impl NodeEntry {
    fn new(descriptor: NodeDescriptor) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            health: NodeHealth::Unknown,
            in_flight: 0,
            successes: 0,
            failures: 0,
            failure_streak: 0,
            trouble_streak: 0,
            success_streak: 0,
            last_probe: None,
            last_error: None,
            last_latency_ms: None,
            models: Arc::new(BTreeSet::new()),
            retired: false,
        }
    }

    fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.descriptor.id.clone(),
            descriptor: self.descriptor.clone(),
            health: self.health,
            in_flight: self.in_flight,
            successes: self.successes,
            failures: self.failures,
            consecutive_failures: self.failure_streak,
            last_probe: self.last_probe,
            last_error: self.last_error.clone(),
            last_latency_ms: self.last_latency_ms,
            models: self.models.clone(),
        }
    }

    fn reset_streaks(&mut self) {
        self.failure_streak = 0;
        self.trouble_streak = 0;
        self.success_streak = 0;
    }

    fn record(&mut self, outcome: &Outcome, thresholds: &HealthThresholds) -> Option<HealthTransition> {
        let dispatch = outcome.source == OutcomeSource::Dispatch;

        if outcome.success {
            let slow = dispatch && thresholds.is_slow(outcome.latency);
            if dispatch {
                self.successes += 1;
            }
            self.failure_streak = 0;
            if slow {
                self.trouble_streak += 1;
                self.success_streak = 0;
            } else {
                self.trouble_streak = 0;
                self.success_streak += 1;
            }
            self.last_latency_ms = Some(outcome.latency.as_millis() as u64);
        } else {
            if dispatch {
                self.failures += 1;
            }
            self.failure_streak += 1;
            self.trouble_streak += 1;
            self.success_streak = 0;
            self.last_error = outcome.error.clone();
        }

        if !dispatch {
            self.last_probe = Some(Utc::now());
        }

        let next = next_health(self.health, outcome, self, thresholds);
        if next == self.health {
            return None;
        }

        let transition = HealthTransition {
            from: self.health,
            to: next,
        };
        self.health = next;
        if next == NodeHealth::Unknown || next == NodeHealth::Healthy {
            self.reset_streaks();
        }
        Some(transition)
    }
}

/// Apply the health state machine to one recorded outcome.
fn next_health(
    current: NodeHealth,
    outcome: &Outcome,
    entry: &NodeEntry,
    thresholds: &HealthThresholds,
) -> NodeHealth {
    let probe = outcome.source == OutcomeSource::Probe;
    let failed_out = entry.failure_streak >= thresholds.unreachable_after;

    match current {
        // Only a synthetic probe may bring a node back.
        NodeHealth::Unreachable if probe && outcome.success => NodeHealth::Unknown,
        NodeHealth::Unreachable => NodeHealth::Unreachable,
        NodeHealth::Unknown if probe => {
            if outcome.success {
                NodeHealth::Healthy
            } else {
                NodeHealth::Unreachable
            }
        }
        NodeHealth::Unknown if failed_out => NodeHealth::Unreachable,
        NodeHealth::Unknown => NodeHealth::Unknown,
        NodeHealth::Healthy | NodeHealth::Degraded if failed_out => NodeHealth::Unreachable,
        NodeHealth::Healthy if entry.trouble_streak >= thresholds.degrade_after => {
            NodeHealth::Degraded
        }
        NodeHealth::Degraded if entry.success_streak >= thresholds.recover_after => {
            NodeHealth::Healthy
        }
        other => other,
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// Active node ids in configuration order.
    order: Vec<String>,
    nodes: HashMap<String, NodeEntry>,
}

/// Registry of backend nodes.
#[derive(Debug)]
pub struct NodeRegistry {
    inner: RwLock<Inner>,
    thresholds: HealthThresholds,
}

impl NodeRegistry {
    /// Create an empty registry.
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            thresholds: thresholds.normalized(),
        }
    }

    /// Create a registry populated with the given nodes, all `Unknown`.
    pub fn from_descriptors(descriptors: Vec<NodeDescriptor>, thresholds: HealthThresholds) -> Self {
        let registry = Self::new(thresholds);
        registry.reconcile(descriptors);
        registry
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    /// Nodes eligible for selection, in configuration order.
    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.nodes.get(id))
            .filter(|e| !e.retired && e.health.is_eligible())
            .map(NodeEntry::snapshot)
            .collect()
    }

    /// Every configured node, including unreachable ones.
    pub fn all(&self) -> Vec<NodeSnapshot> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.nodes.get(id))
            .filter(|e| !e.retired)
            .map(NodeEntry::snapshot)
            .collect()
    }

    /// Get one configured node by id.
    pub fn get(&self, id: &str) -> Option<NodeSnapshot> {
        let inner = self.inner.read();
        inner
            .nodes
            .get(id)
            .filter(|e| !e.retired)
            .map(NodeEntry::snapshot)
    }

    /// Number of configured nodes.
    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a probe or dispatch outcome and apply any health transition.
    ///
    /// Outcomes for nodes that no longer exist are logged and dropped.
    pub fn report_outcome(&self, id: &str, outcome: Outcome) -> Option<HealthTransition> {
        let transition = {
            let mut inner = self.inner.write();
            let Some(entry) = inner.nodes.get_mut(id) else {
                tracing::warn!(
                    "Dropping {:?} outcome for unknown node {}",
                    outcome.source,
                    id
                );
                return None;
            };
            entry.record(&outcome, &self.thresholds)
        };

        if let Some(t) = transition {
            log_transition(id, t, outcome.error.as_deref());
        }
        transition
    }

    /// Force a node into `state`. Returns whether the state changed.
    pub fn set_health(&self, id: &str, state: NodeHealth) -> bool {
        let transition = {
            let mut inner = self.inner.write();
            let Some(entry) = inner.nodes.get_mut(id) else {
                tracing::warn!("Cannot set health of unknown node {}", id);
                return false;
            };
            if entry.health == state {
                return false;
            }
            let t = HealthTransition {
                from: entry.health,
                to: state,
            };
            entry.health = state;
            entry.reset_streaks();
            t
        };

        log_transition(id, transition, None);
        true
    }

    /// Mark a new attempt against `id` as in flight.
    ///
    /// The returned guard releases the slot when dropped. Returns `None` if
    /// the node is gone or was removed by a reconcile.
    pub fn begin_attempt(self: &Arc<Self>, id: &str) -> Option<InFlightGuard> {
        let mut inner = self.inner.write();
        let entry = inner.nodes.get_mut(id).filter(|e| !e.retired)?;
        entry.in_flight += 1;
        Some(InFlightGuard {
            registry: Arc::clone(self),
            node_id: id.to_string(),
        })
    }

    fn finish_attempt(&self, id: &str) {
        let mut inner = self.inner.write();
        let drop_entry = match inner.nodes.get_mut(id) {
            Some(entry) => {
                entry.in_flight = entry.in_flight.saturating_sub(1);
                entry.retired && entry.in_flight == 0
            }
            None => false,
        };
        if drop_entry {
            inner.nodes.remove(id);
            tracing::debug!("Dropped retired node {} after its last request finished", id);
        }
    }

    /// Replace the synced model list of a node.
    pub fn update_models(&self, id: &str, models: BTreeSet<String>) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.nodes.get_mut(id) {
            if *entry.models != models {
                entry.models = Arc::new(models);
            }
        }
    }

    /// Diff the registry against a new node list.
    ///
    /// New ids become `Unknown` nodes, changed descriptors are swapped in
    /// place keeping their health and counters, and missing ids are retired:
    /// excluded from selection immediately, physically dropped once no
    /// request is in flight to them.
    pub fn reconcile(&self, descriptors: Vec<NodeDescriptor>) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let wanted: HashSet<String> = descriptors.iter().map(|d| d.id.clone()).collect();
        let order: Vec<String> = descriptors.iter().map(|d| d.id.clone()).collect();

        for descriptor in descriptors {
            match inner.nodes.get_mut(&descriptor.id) {
                Some(entry) if entry.retired => {
                    let in_flight = entry.in_flight;
                    summary.added.push(descriptor.id.clone());
                    *entry = NodeEntry::new(descriptor);
                    entry.in_flight = in_flight;
                }
                Some(entry) => {
                    if *entry.descriptor != descriptor {
                        summary.updated.push(descriptor.id.clone());
                        entry.descriptor = Arc::new(descriptor);
                    }
                }
                None => {
                    summary.added.push(descriptor.id.clone());
                    inner
                        .nodes
                        .insert(descriptor.id.clone(), NodeEntry::new(descriptor));
                }
            }
        }

        for (id, entry) in inner.nodes.iter_mut() {
            if !wanted.contains(id) && !entry.retired {
                entry.retired = true;
                summary.removed.push(id.clone());
            }
        }
        inner.nodes.retain(|_, e| !(e.retired && e.in_flight == 0));
        inner.order = order;

        summary.removed.sort();
        summary
    }
}

fn log_transition(id: &str, t: HealthTransition, error: Option<&str>) {
    match t.to {
        NodeHealth::Unreachable => tracing::warn!(
            "Node {} is now unreachable (was {}): {}",
            id,
            t.from,
            error.unwrap_or("no error recorded")
        ),
        NodeHealth::Degraded => tracing::warn!("Node {} degraded (was {})", id, t.from),
        _ => tracing::info!("Node {} is now {} (was {})", id, t.to, t.from),
    }
}

/// In-flight slot on a node, released on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    registry: Arc<NodeRegistry>,
    node_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.finish_attempt(&self.node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(ids: &[&str]) -> Arc<NodeRegistry> {
        let descriptors = ids
            .iter()
            .map(|id| NodeDescriptor::new(*id, format!("{}.local", id), 11434))
            .collect();
        Arc::new(NodeRegistry::from_descriptors(
            descriptors,
            HealthThresholds::default(),
        ))
    }

    fn ids(nodes: &[NodeSnapshot]) -> Vec<&str> {
        nodes.iter().map(|n| n.id.as_str()).collect()
    }

    fn fail(registry: &NodeRegistry, id: &str, times: usize) {
        for _ in 0..times {
            registry.report_outcome(id, Outcome::dispatch_failed(Duration::ZERO, "boom"));
        }
    }

    #[test]
    fn test_new_nodes_are_unknown_and_eligible() {
        let registry = registry(&["a", "b", "c"]);
        let snapshot = registry.snapshot();
        assert_eq!(ids(&snapshot), vec!["a", "b", "c"]);
        assert!(snapshot.iter().all(|n| n.health == NodeHealth::Unknown));
    }

    #[test]
    fn test_probe_transitions_from_unknown() {
        let registry = registry(&["a", "b"]);

        let t = registry.report_outcome("a", Outcome::probe_ok(Duration::from_millis(5)));
        assert_eq!(
            t,
            Some(HealthTransition {
                from: NodeHealth::Unknown,
                to: NodeHealth::Healthy
            })
        );

        registry.report_outcome("b", Outcome::probe_failed(Duration::ZERO, "refused"));
        assert_eq!(registry.get("b").unwrap().health, NodeHealth::Unreachable);
        assert_eq!(ids(&registry.snapshot()), vec!["a"]);
        assert!(registry.get("a").unwrap().last_probe.is_some());
    }

    #[test]
    fn test_dispatch_failures_degrade_then_exclude() {
        let registry = registry(&["a", "b", "c"]);
        for id in ["a", "b", "c"] {
            registry.report_outcome(id, Outcome::probe_ok(Duration::ZERO));
        }

        fail(&registry, "b", 2);
        assert_eq!(registry.get("b").unwrap().health, NodeHealth::Degraded);
        assert_eq!(registry.snapshot().len(), 3);

        fail(&registry, "b", 1);
        assert_eq!(registry.get("b").unwrap().health, NodeHealth::Unreachable);
        assert_eq!(ids(&registry.snapshot()), vec!["a", "c"]);
        assert_eq!(registry.get("b").unwrap().failures, 3);
    }

    #[test]
    fn test_unknown_node_fails_out_via_dispatch() {
        let registry = registry(&["a"]);
        fail(&registry, "a", 2);
        assert_eq!(registry.get("a").unwrap().health, NodeHealth::Unknown);
        fail(&registry, "a", 1);
        assert_eq!(registry.get("a").unwrap().health, NodeHealth::Unreachable);
    }

    #[test]
    fn test_only_probe_reinstates_unreachable() {
        let registry = registry(&["a"]);
        registry.report_outcome("a", Outcome::probe_failed(Duration::ZERO, "down"));
        assert!(registry.snapshot().is_empty());

        registry.report_outcome("a", Outcome::dispatch_ok(Duration::ZERO));
        assert_eq!(registry.get("a").unwrap().health, NodeHealth::Unreachable);

        registry.report_outcome("a", Outcome::probe_ok(Duration::ZERO));
        assert_eq!(registry.get("a").unwrap().health, NodeHealth::Unknown);
        assert_eq!(ids(&registry.snapshot()), vec!["a"]);

        registry.report_outcome("a", Outcome::probe_ok(Duration::ZERO));
        assert_eq!(registry.get("a").unwrap().health, NodeHealth::Healthy);
    }

    #[test]
    fn test_degraded_recovers_after_successes() {
        let registry = registry(&["a"]);
        registry.report_outcome("a", Outcome::probe_ok(Duration::ZERO));
        fail(&registry, "a", 2);
        assert_eq!(registry.get("a").unwrap().health, NodeHealth::Degraded);

        registry.report_outcome("a", Outcome::dispatch_ok(Duration::ZERO));
        assert_eq!(registry.get("a").unwrap().health, NodeHealth::Degraded);
        registry.report_outcome("a", Outcome::dispatch_ok(Duration::ZERO));
        assert_eq!(registry.get("a").unwrap().health, NodeHealth::Healthy);
    }

    #[test]
    fn test_slow_successes_degrade() {
        let thresholds = HealthThresholds {
            slow_threshold_ms: Some(100),
            ..Default::default()
        };
        let registry = NodeRegistry::from_descriptors(
            vec![NodeDescriptor::new("a", "h", 1)],
            thresholds,
        );
        registry.report_outcome("a", Outcome::probe_ok(Duration::ZERO));

        for _ in 0..2 {
            registry.report_outcome("a", Outcome::dispatch_ok(Duration::from_millis(500)));
        }
        let node = registry.get("a").unwrap();
        assert_eq!(node.health, NodeHealth::Degraded);
        assert_eq!(node.failures, 0);
        assert_eq!(node.successes, 2);
    }

    #[test]
    fn test_outcome_for_unknown_node_is_ignored() {
        let registry = registry(&["a"]);
        assert!(registry
            .report_outcome("ghost", Outcome::dispatch_failed(Duration::ZERO, "x"))
            .is_none());
        assert!(!registry.set_health("ghost", NodeHealth::Healthy));
    }

    #[test]
    fn test_set_health_is_idempotent() {
        let registry = registry(&["a"]);
        assert!(registry.set_health("a", NodeHealth::Healthy));
        assert!(!registry.set_health("a", NodeHealth::Healthy));
        assert_eq!(registry.get("a").unwrap().health, NodeHealth::Healthy);
    }

    #[test]
    fn test_in_flight_guard() {
        let registry = registry(&["a"]);
        let first = registry.begin_attempt("a").unwrap();
        let second = registry.begin_attempt("a").unwrap();
        assert_eq!(registry.get("a").unwrap().in_flight, 2);

        drop(first);
        assert_eq!(registry.get("a").unwrap().in_flight, 1);
        drop(second);
        assert_eq!(registry.get("a").unwrap().in_flight, 0);
        assert!(registry.begin_attempt("ghost").is_none());
    }

    #[test]
    fn test_reconcile_adds_updates_and_retires() {
        let registry = registry(&["a", "b"]);
        registry.report_outcome("a", Outcome::probe_ok(Duration::ZERO));

        let summary = registry.reconcile(vec![
            NodeDescriptor::new("a", "a.local", 11434).with_weight(2.0),
            NodeDescriptor::new("c", "c.local", 11434),
        ]);

        assert_eq!(summary.added, vec!["c".to_string()]);
        assert_eq!(summary.updated, vec!["a".to_string()]);
        assert_eq!(summary.removed, vec!["b".to_string()]);
        assert_eq!(ids(&registry.all()), vec!["a", "c"]);

        let a = registry.get("a").unwrap();
        assert_eq!(a.health, NodeHealth::Healthy);
        assert_eq!(a.descriptor.weight, 2.0);
        assert_eq!(registry.get("c").unwrap().health, NodeHealth::Unknown);
        assert!(registry.get("b").is_none());
    }

    #[test]
    fn test_retired_node_survives_until_in_flight_done() {
        let registry = registry(&["a", "b"]);
        let guard = registry.begin_attempt("b").unwrap();

        registry.reconcile(vec![NodeDescriptor::new("a", "a.local", 11434)]);
        assert_eq!(ids(&registry.snapshot()), vec!["a"]);

        // The in-flight request can still report its outcome.
        registry.report_outcome("b", Outcome::dispatch_ok(Duration::ZERO));
        drop(guard);

        assert!(registry
            .report_outcome("b", Outcome::dispatch_ok(Duration::ZERO))
            .is_none());
        assert!(registry.begin_attempt("b").is_none());
    }

    #[test]
    fn test_retired_node_takes_no_new_attempts() {
        let registry = registry(&["a", "b"]);
        let stale_view = registry.snapshot();
        let guard = registry.begin_attempt("b").unwrap();

        registry.reconcile(vec![NodeDescriptor::new("a", "a.local", 11434)]);

        // Still present with one request in flight, but closed to new work
        // even for a caller holding a snapshot from before the reconcile.
        assert!(stale_view.iter().any(|n| n.id == "b"));
        assert!(registry.begin_attempt("b").is_none());
        assert!(registry.begin_attempt("a").is_some());
        drop(guard);
        assert!(registry.begin_attempt("b").is_none());
    }

    #[test]
    fn test_readding_retired_node_resets_it() {
        let registry = registry(&["a", "b"]);
        let guard = registry.begin_attempt("b").unwrap();
        fail(&registry, "b", 3);
        registry.reconcile(vec![NodeDescriptor::new("a", "a.local", 11434)]);

        let summary = registry.reconcile(vec![
            NodeDescriptor::new("a", "a.local", 11434),
            NodeDescriptor::new("b", "b.local", 11434),
        ]);
        assert_eq!(summary.added, vec!["b".to_string()]);

        let b = registry.get("b").unwrap();
        assert_eq!(b.health, NodeHealth::Unknown);
        assert_eq!(b.in_flight, 1);
        assert_eq!(b.failures, 0);
        drop(guard);
        assert_eq!(registry.get("b").unwrap().in_flight, 0);
    }

    #[test]
    fn test_concurrent_outcomes_are_not_lost() {
        let registry = registry(&["a"]);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        registry.report_outcome("a", Outcome::dispatch_ok(Duration::ZERO));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.get("a").unwrap().successes, 800);
    }

    #[test]
    fn test_update_models() {
        let registry = registry(&["a"]);
        registry.update_models("a", ["llama3".to_string()].into_iter().collect());
        assert!(registry.get("a").unwrap().has_model("llama3"));
        registry.update_models("ghost", BTreeSet::new());
    }
}
