//! Per-request dispatch state.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;

use crate::routing::ModelRequirement;

/// State of one inbound request while the dispatcher works on it.
#[derive(Debug)]
pub struct RequestContext {
    pub id: String,
    deadline: Instant,
    attempts: u32,
    tried: HashSet<String>,
    /// Model the request asked for, if one could be extracted.
    pub model: Option<ModelRequirement>,
}

impl RequestContext {
    pub fn new(budget: Duration, model: Option<ModelRequirement>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            deadline: Instant::now() + budget,
            attempts: 0,
            tried: HashSet::new(),
            model,
        }
    }

    /// Time left before the deadline, `None` once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        let left = self.deadline.saturating_duration_since(Instant::now());
        (!left.is_zero()).then_some(left)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn has_tried(&self, node_id: &str) -> bool {
        self.tried.contains(node_id)
    }

    pub fn record_attempt(&mut self, node_id: &str) {
        self.attempts += 1;
        self.tried.insert(node_id.to_string());
    }

    /// Skip a node for this request without counting an attempt.
    pub fn exclude(&mut self, node_id: &str) {
        self.tried.insert(node_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_attempt() {
        let mut ctx = RequestContext::new(Duration::from_secs(10), None);
        assert_eq!(ctx.attempts(), 0);
        ctx.record_attempt("a");
        ctx.record_attempt("b");
        assert_eq!(ctx.attempts(), 2);
        assert!(ctx.has_tried("a"));
        assert!(!ctx.has_tried("c"));
        assert!(ctx.remaining().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let ctx = RequestContext::new(Duration::from_millis(50), None);
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(ctx.remaining().is_none());
    }
}
