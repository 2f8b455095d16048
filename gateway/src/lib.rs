pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod routes;
pub mod routing;
pub mod scheduler;

pub use config::Config;
pub use dispatcher::{Dispatcher, ForwardRequest, Forwarded};
pub use error::{Error, Result};
pub use health::{HealthHandle, HealthMonitor, HttpProbe, NodeProbe};
pub use metrics::GatewayMetrics;
pub use routing::ModelRouter;
pub use scheduler::{Scheduler, Strategy};

use std::sync::Arc;

use axum::middleware;
use axum::Router;
use chrono::{DateTime, Utc};
use ollama_fleet_common::NodeRegistry;
use reqwest::Client;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state.
pub struct AppState {
    /// Node config file re-read on reload.
    pub config_path: String,
    pub max_body_bytes: usize,
    pub registry: Arc<NodeRegistry>,
    pub dispatcher: Dispatcher,
    pub metrics: Arc<GatewayMetrics>,
    /// Re-check requests for newly added nodes.
    pub health: HealthHandle,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Build the gateway from configuration.
    ///
    /// Fails when no valid node is configured. The returned monitor is not
    /// started; call [`HealthMonitor::spawn`] on it.
    pub fn build(config: &Config, config_path: impl Into<String>) -> Result<(Arc<Self>, HealthMonitor)> {
        let parsed = config.parse_nodes();
        if parsed.nodes.is_empty() {
            return Err(Error::Configuration(format!(
                "no valid nodes configured ({} rejected)",
                parsed.rejected.len()
            )));
        }

        let registry = Arc::new(NodeRegistry::from_descriptors(
            parsed.nodes,
            config.health.thresholds(),
        ));

        let client = Client::builder()
            .connect_timeout(config.dispatch.connect_timeout())
            .build()
            .map_err(|e| Error::Internal(format!("failed to create HTTP client: {}", e)))?;

        let probe = Arc::new(HttpProbe::new(client.clone()));
        let (monitor, health) = HealthMonitor::new(registry.clone(), probe, &config.health);

        let metrics = Arc::new(GatewayMetrics::new());
        let dispatcher = Dispatcher::new(
            registry.clone(),
            Scheduler::new(config.scheduling.strategy),
            ModelRouter::new(&config.routing),
            client,
            health.clone(),
            metrics.clone(),
            config.dispatch.clone(),
        );

        let state = Arc::new(Self {
            config_path: config_path.into(),
            max_body_bytes: config.dispatch.max_body_bytes,
            registry,
            dispatcher,
            metrics,
            health,
            started_at: Utc::now(),
        });
        Ok((state, monitor))
    }
}

/// The gateway's HTTP application: its own endpoints plus the proxy fallback.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::health::router())
        .merge(routes::nodes::router())
        .merge(routes::admin::router())
        .fallback(routes::proxy::proxy)
        .layer(middleware::from_fn(logging::request_logger))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
