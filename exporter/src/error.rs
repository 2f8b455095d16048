//! Error types for the exporter.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Scrape of node {node} failed: {message}")]
    ScrapeFailure { node: String, message: String },

    #[error("Scrape of node {node} timed out after {timeout:?}")]
    ScrapeTimeout { node: String, timeout: Duration },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn scrape(node: &str, message: impl Into<String>) -> Self {
        Error::ScrapeFailure {
            node: node.to_string(),
            message: message.into(),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Configuration(e.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            Error::ScrapeFailure { .. } | Error::ScrapeTimeout { .. } => {
                (StatusCode::BAD_GATEWAY, "scrape_failure")
            }
            Error::NodeNotFound(_) => (StatusCode::NOT_FOUND, "node_not_found"),
            Error::Configuration(_) => (StatusCode::UNPROCESSABLE_ENTITY, "configuration_error"),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
