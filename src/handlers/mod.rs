// src/handlers/mod.rs

pub mod base;
pub mod invalid_api_key;
pub mod processor;
pub mod quota;
pub mod rate_limit;
pub mod server_error;
pub mod success;
pub mod terminal_error;
pub mod timeout;

pub use base::{Action, ResponseHandler};
pub use processor::ResponseProcessor;

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::upstream::{ForwardRequest, UpstreamResponse};
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Response headers recomputed by the server rather than copied from upstream.
const STRIPPED_RESPONSE_HEADERS: &[header::HeaderName] = &[
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::CONTENT_LENGTH,
    header::CONTENT_ENCODING,
];

/// Forwards any `/v1/*` request through the dispatcher.
///
/// Dropping this future (client disconnect) or hitting the request timeout
/// abandons the upstream call and releases the key's reservation.
#[instrument(name = "proxy_request", skip_all, fields(http.method = %method, url.path = %uri.path()))]
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let path_and_query = uri.path_and_query().map_or_else(|| uri.path().to_string(), |pq| pq.to_string());
    let request = ForwardRequest::new(method, path_and_query, headers, body);
    debug!(model = request.model.as_deref().unwrap_or("-"), "Dispatching request");

    let timeout_secs = state.config.server.request_timeout_secs;
    let dispatcher = state.key_manager.dispatcher();
    let response = tokio::time::timeout(Duration::from_secs(timeout_secs), dispatcher.dispatch(&request))
        .await
        .map_err(|_| AppError::RequestTimeout { timeout_secs })??;

    Ok(into_axum_response(response))
}

fn into_axum_response(upstream: UpstreamResponse) -> Response {
    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;
    let headers = response.headers_mut();
    for (name, value) in &upstream.headers {
        if !STRIPPED_RESPONSE_HEADERS.contains(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    response
}

/// `GET /health`: ready when at least one key can be selected.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.key_manager.stats();
    let ready = stats.eligible > 0 || stats.unknown > 0;
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(json!({
            "status": if ready { "ok" } else { "degraded" },
            "keys": stats,
        })),
    )
}
