//! Admin routes.
//!
//! Provides `POST /api/config/reload`: re-read the node config file and
//! reconcile the registry with it. Only the node list is hot-reloadable.

use std::sync::Arc;

use axum::extract::State;
use axum::{routing::post, Json, Router};
use serde::Serialize;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::AppState;

#[derive(Debug, Serialize)]
struct ReloadResponse {
    status: &'static str,
    added: Vec<String>,
    updated: Vec<String>,
    removed: Vec<String>,
    rejected: Vec<String>,
    disabled: Vec<String>,
    total_nodes: usize,
}

async fn reload(State(state): State<Arc<AppState>>) -> Result<Json<ReloadResponse>> {
    let config = Config::load_from(&state.config_path)?;
    let parsed = config.parse_nodes();

    if parsed.nodes.is_empty() {
        tracing::warn!(
            "Rejecting reload of {}: no valid nodes ({} rejected)",
            state.config_path,
            parsed.rejected.len()
        );
        return Err(Error::Configuration(format!(
            "reload rejected: no valid nodes in {} ({} rejected)",
            state.config_path,
            parsed.rejected.len()
        )));
    }

    let summary = state.registry.reconcile(parsed.nodes);
    for id in &summary.added {
        state.health.request_recheck(id);
    }
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
        disabled: parsed.disabled,
        total_nodes: state.registry.len(),
    }))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/config/reload", post(reload))
}
