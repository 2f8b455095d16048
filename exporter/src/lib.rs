pub mod api;
pub mod collector;
pub mod config;
pub mod error;
pub mod local;
pub mod state;

pub use collector::{CachedNode, CollectorSnapshot, MetricsCollector, NodeMetrics};
pub use config::Config;
pub use error::{Error, Result};
pub use state::AppState;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// The exporter's HTTP application.
pub fn app(state: Arc<AppState>) -> Router {
    api::router()
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
