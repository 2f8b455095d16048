//! Request dispatch: selection, forwarding, failover.
//!
//! One call to [`Dispatcher::dispatch`] owns a request from arrival until a
//! node answers or the gateway gives up. Each attempt picks a node the
//! request has not tried yet, holds an in-flight slot on it, and reports its
//! outcome to the registry before the next selection. Retryable failures
//! (transport errors, timeouts, 5xx and 429) move on to another node; any
//! other response is streamed back unchanged.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use ollama_fleet_common::{InFlightGuard, NodeHealth, NodeRegistry, NodeSnapshot, Outcome};
use reqwest::Client;

use crate::config::DispatchConfig;
use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::health::HealthHandle;
use crate::metrics::{GatewayMetrics, NO_NODE};
use crate::routing::{extract_model, ModelRouter};
use crate::scheduler::Scheduler;

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// 5xx and 429 are worth another node; everything else is the node's answer.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// An inbound request, buffered so it can be replayed on another node.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ForwardRequest {
    fn path_and_query(&self) -> &str {
        self.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
    }
}

/// A node's response, ready to stream back to the caller.
#[derive(Debug)]
pub struct Forwarded {
    pub node_id: String,
    pub attempts: u32,
    pub response: Response,
}

impl IntoResponse for Forwarded {
    fn into_response(self) -> Response {
        self.response
    }
}

pub struct Dispatcher {
    registry: Arc<NodeRegistry>,
    scheduler: Scheduler,
    router: ModelRouter,
    client: Client,
    health: HealthHandle,
    metrics: Arc<GatewayMetrics>,
    settings: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<NodeRegistry>,
        scheduler: Scheduler,
        router: ModelRouter,
        client: Client,
        health: HealthHandle,
        metrics: Arc<GatewayMetrics>,
        settings: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            scheduler,
            router,
            client,
            health,
            metrics,
            settings,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    /// Forward `request` to a node, failing over until one answers.
    pub async fn dispatch(&self, request: ForwardRequest) -> Result<Forwarded> {
        let requirement = extract_model(&request.uri, &request.body)
            .map(|model| self.router.requirement(&model));
        let mut ctx = RequestContext::new(self.settings.request_deadline(), requirement);
        let result = self.run(&request, &mut ctx).await;

        if let Err(e) = &result {
            let status = e.status_label();
            tracing::warn!(
                request_id = %ctx.id,
                attempts = ctx.attempts(),
                "Giving up on {} {}: {}",
                request.method,
                request.uri.path(),
                e
            );
            self.metrics
                .record(&request.method, NO_NODE, status, Duration::ZERO);
        }
        result
    }

    async fn run(&self, request: &ForwardRequest, ctx: &mut RequestContext) -> Result<Forwarded> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut empty_rounds = 0;

        loop {
            let Some(remaining) = ctx.remaining() else {
                return Err(Error::DeadlineExceeded {
                    attempts: ctx.attempts(),
                });
            };
            if ctx.attempts() >= max_attempts {
                return Err(Error::NodeUnavailable(format!(
                    "all {} attempt(s) failed",
                    ctx.attempts()
                )));
            }

            let eligible = self.registry.snapshot();
            let Some(node) = self.select(&eligible, ctx) else {
                if ctx.attempts() == 0 && eligible.is_empty() && empty_rounds < self.settings.unavailable_retries {
                    empty_rounds += 1;
                    tokio::time::sleep(self.settings.unavailable_backoff().min(remaining)).await;
                    continue;
                }
                return Err(Error::NodeUnavailable(if ctx.attempts() == 0 {
                    "no eligible node".to_string()
                } else {
                    format!("no untried node left after {} attempt(s)", ctx.attempts())
                }));
            };

            let Some(guard) = self.registry.begin_attempt(&node.id) else {
                // Removed between snapshot and attempt; nothing was sent.
                ctx.exclude(&node.id);
                continue;
            };
            ctx.record_attempt(&node.id);

            let timeout = self.settings.attempt_timeout().min(remaining);
            let pending = PendingAttempt::new(self, &node.id);
            let result = self.forward(&node, request, timeout).await;
            let latency = pending.started.elapsed();

            match result {
                Ok(response) if is_retryable_status(response.status()) => {
                    let status = response.status();
                    self.metrics
                        .record(&request.method, &node.id, status.as_str(), latency);
                    pending.report(Outcome::dispatch_failed(latency, format!("node returned {}", status)));
                    tracing::warn!(
                        request_id = %ctx.id,
                        node = %node.id,
                        attempt = ctx.attempts(),
                        "Node returned {}, retrying on another node",
                        status
                    );
                }
                Ok(response) => {
                    let status = response.status();
                    self.metrics
                        .record(&request.method, &node.id, status.as_str(), latency);
                    pending.report(Outcome::dispatch_ok(latency));
                    tracing::debug!(
                        request_id = %ctx.id,
                        node = %node.id,
                        attempt = ctx.attempts(),
                        "Forwarded {} {} -> {}",
                        request.method,
                        request.uri.path(),
                        status
                    );
                    return Ok(Forwarded {
                        node_id: node.id.clone(),
                        attempts: ctx.attempts(),
                        response: stream_response(response, guard),
                    });
                }
                Err(e) => {
                    self.metrics
                        .record(&request.method, &node.id, e.status_label(), latency);
                    pending.report(Outcome::dispatch_failed(latency, e.to_string()));
                    tracing::warn!(
                        request_id = %ctx.id,
                        node = %node.id,
                        attempt = ctx.attempts(),
                        "Attempt failed: {}",
                        e
                    );
                }
            }
        }
    }

    /// Pick the next node, preferring nodes suited to the requested model.
    fn select(&self, eligible: &[NodeSnapshot], ctx: &RequestContext) -> Option<NodeSnapshot> {
        self.scheduler.retain_nodes(eligible);
        let candidates = self.router.candidates(eligible.to_vec(), ctx.model.as_ref());
        self.scheduler.select(&candidates, ctx).or_else(|| {
            if candidates.len() < eligible.len() {
                self.scheduler.select(eligible, ctx)
            } else {
                None
            }
        })
    }

    fn report(&self, node_id: &str, outcome: Outcome) {
        if let Some(transition) = self.registry.report_outcome(node_id, outcome) {
            if transition.to == NodeHealth::Degraded {
                self.health.request_recheck(node_id);
            }
        }
    }

    async fn forward(
        &self,
        node: &NodeSnapshot,
        request: &ForwardRequest,
        timeout: Duration,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", node.base_url(), request.path_and_query());

        let mut headers = HeaderMap::new();
        for (name, value) in request.headers.iter() {
            if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        for (name, value) in node.descriptor.request_headers() {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::warn!("Skipping invalid header {} configured for node {}", name, node.id),
            }
        }

        let send = self
            .client
            .request(request.method.clone(), &url)
            .headers(headers)
            .body(request.body.clone())
            .send();

        match tokio::time::timeout(timeout, send).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) if e.is_timeout() => Err(Error::AttemptTimeout {
                node: node.id.clone(),
                timeout,
            }),
            Ok(Err(e)) => Err(Error::NodeTransport {
                node: node.id.clone(),
                message: e.to_string(),
            }),
            Err(_) => Err(Error::AttemptTimeout {
                node: node.id.clone(),
                timeout,
            }),
        }
    }
}

/// One attempt's outcome, reported to the registry exactly once.
///
/// Dropped without a report, the caller went away while the node had not
/// answered yet; that counts as a failed dispatch.
struct PendingAttempt<'a> {
    dispatcher: &'a Dispatcher,
    node_id: String,
    started: Instant,
    reported: bool,
}

impl<'a> PendingAttempt<'a> {
    fn new(dispatcher: &'a Dispatcher, node_id: &str) -> Self {
        Self {
            dispatcher,
            node_id: node_id.to_string(),
            started: Instant::now(),
            reported: false,
        }
    }

    fn report(mut self, outcome: Outcome) {
        self.reported = true;
        self.dispatcher.report(&self.node_id, outcome);
    }
}

impl Drop for PendingAttempt<'_> {
    fn drop(&mut self) {
        if self.reported {
            return;
        }
        tracing::debug!(node = %self.node_id, "Caller went away before the node answered");
        self.dispatcher.report(
            &self.node_id,
            Outcome::dispatch_failed(self.started.elapsed(), "cancelled by caller"),
        );
    }
}

/// Stream a node response back; the in-flight slot is held until the body ends.
fn stream_response(upstream: reqwest::Response, guard: InFlightGuard) -> Response {
    let status = upstream.status();
    let mut headers = HeaderMap::new();
    for (name, value) in upstream.headers().iter() {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }

    let body = Body::from_stream(upstream.bytes_stream().map(move |chunk| {
        let _held = &guard;
        chunk
    }));

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_status() {
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::OK));
    }

    #[test]
    fn test_hop_by_hop() {
        assert!(is_hop_by_hop(&header::CONNECTION));
        assert!(is_hop_by_hop(&header::TRANSFER_ENCODING));
        assert!(!is_hop_by_hop(&header::CONTENT_TYPE));
    }

    #[test]
    fn test_path_and_query() {
        let request = ForwardRequest {
            method: Method::GET,
            uri: "/api/show?model=llama3".parse().unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };
        assert_eq!(request.path_and_query(), "/api/show?model=llama3");
    }
}
