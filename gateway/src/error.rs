//! Error types for the gateway.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No healthy node available: {0}")]
    NodeUnavailable(String),

    #[error("Request deadline exceeded after {attempts} attempt(s)")]
    DeadlineExceeded { attempts: u32 },

    #[error("Node {node} did not respond within {timeout:?}")]
    AttemptTimeout { node: String, timeout: Duration },

    #[error("Node {node} transport error: {message}")]
    NodeTransport { node: String, message: String },

    #[error("Probe failed: {0}")]
    ProbeFailure(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Value of the `status` metric label for a request that got no node response.
    pub fn status_label(&self) -> &'static str {
        match self {
            Error::NodeUnavailable(_) => "503",
            Error::DeadlineExceeded { .. } => "504",
            Error::AttemptTimeout { .. } => "timeout",
            _ => "error",
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
            Error::NodeUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "no_healthy_node"),
            Error::DeadlineExceeded { .. } | Error::AttemptTimeout { .. } => {
                (StatusCode::GATEWAY_TIMEOUT, "timeout")
            }
            Error::NodeTransport { .. } | Error::ProbeFailure(_) => {
                (StatusCode::BAD_GATEWAY, "node_error")
            }
            Error::Configuration(_) => (StatusCode::UNPROCESSABLE_ENTITY, "configuration_error"),
            Error::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
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
