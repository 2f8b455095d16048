//! Scrape API: Prometheus metrics, JSON snapshot, health and reload.

pub mod admin;
pub mod health;
pub mod metrics;

use std::sync::Arc;

use axum::{routing::get, Router};

use crate::state::AppState;

/// Build the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(metrics::router())
        .merge(admin::router())
        .route("/health", get(health::health))
}
