// src/handlers/base.rs

use crate::pool::KeyFault;
use crate::upstream::UpstreamResponse;

/// How the dispatcher should treat an upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Return the response to the caller and credit the key.
    Success,
    /// The key is at fault. Penalize it and try a different one.
    KeyFault(KeyFault),
    /// Provider-side hiccup (timeout, 5xx). Retry with backoff.
    Transient,
    /// The caller's request is at fault. Surface immediately, no penalty.
    RequestFault,
}

/// A trait for classifying responses from the upstream service.
/// Each implementation is responsible for a specific case (e.g., success, rate limit).
pub trait ResponseHandler: Send + Sync {
    /// Returns `Some(Action)` if this handler recognises the response,
    /// `None` to let the next handler in the chain try.
    fn handle(&self, response: &UpstreamResponse) -> Option<Action>;
}

/// Lower-cased body text for marker matching.
pub(crate) fn body_text(response: &UpstreamResponse) -> String {
    String::from_utf8_lossy(&response.body).to_lowercase()
}

#[cfg(test)]
pub(crate) fn test_response(status: u16, body: &str) -> UpstreamResponse {
    use axum::{body::Bytes, http::{HeaderMap, StatusCode}};
    UpstreamResponse {
        status: StatusCode::from_u16(status).unwrap(),
        headers: HeaderMap::new(),
        body: Bytes::from(body.to_string()),
    }
}
