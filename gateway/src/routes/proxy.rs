//! Catch-all route forwarding every other request to a node.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{HeaderMap, Method, Uri};

use crate::dispatcher::{ForwardRequest, Forwarded};
use crate::error::{Error, Result};
use crate::AppState;

pub async fn proxy(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<Forwarded> {
    let body = to_bytes(body, state.max_body_bytes)
        .await
        .map_err(|e| Error::InvalidRequest(format!("failed to read request body: {}", e)))?;

    state
        .dispatcher
        .dispatch(ForwardRequest {
            method,
            uri,
            headers,
            body,
        })
        .await
}
