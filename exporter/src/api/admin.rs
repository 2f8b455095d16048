//! `POST /api/config/reload`: re-read the node file and reconcile the
//! registry. Removed nodes leave the cache on the next poll.

use std::sync::Arc;

use axum::extract::State;
use axum::{routing::post, Json, Router};
use serde::Serialize;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct ReloadResponse {
    status: &'static str,
    added: Vec<String>,
    updated: Vec<String>,
    removed: Vec<String>,
    rejected: Vec<String>,
    total_nodes: usize,
}

async fn reload(State(state): State<Arc<AppState>>) -> Result<Json<ReloadResponse>> {
    let config = Config::load_from(&state.config_path)?;
    let parsed = config.parse_nodes();

    if parsed.nodes.is_empty() && !state.collector.watches_local() {
        tracing::warn!(
            "Rejecting reload of {}: no valid nodes ({} rejected)",
            state.config_path,
            parsed.rejected.len()
        );
        return Err(Error::Configuration(format!(
            "reload rejected: nothing to export in {} ({} rejected)",
            state.config_path,
            parsed.rejected.len()
        )));
    }

    let summary = state.registry.reconcile(parsed.nodes);
    if summary.is_noop() {
        tracing::info!("Reloaded {}: no node changes", state.config_path);
    } else {
        tracing::info!(
            "Reloaded {}: {} added, {} updated, {} removed",
            state.config_path,
            summary.added.len(),
            summary.updated.len(),
            summary.removed.len()
        );
    }

    Ok(Json(ReloadResponse {
        status: "reloaded",
        added: summary.added,
        updated: summary.updated,
        removed: summary.removed,
        rejected: parsed.rejected.iter().map(|e| e.to_string()).collect(),
        total_nodes: state.registry.len(),
    }))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/config/reload", post(reload))
}
