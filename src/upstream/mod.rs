// src/upstream/mod.rs

//! Upstream LLM API collaborator: balance/health queries and request forwarding.

pub mod http;

pub use http::HttpUpstream;

use crate::error::Result;
use async_trait::async_trait;
use axum::{
    body::Bytes,
    http::{HeaderMap, Method, StatusCode},
};
use thiserror::Error;

/// An inbound request, buffered and ready to be replayed against any key.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Model named in the JSON body, if any.
    pub model: Option<String>,
}

impl ForwardRequest {
    pub fn new(method: Method, path_and_query: impl Into<String>, headers: HeaderMap, body: Bytes) -> Self {
        let model = extract_model(&body);
        Self {
            method,
            path_and_query: path_and_query.into(),
            headers,
            body,
            model,
        }
    }

    /// Rough token cost used for TPM admission: ~4 bytes per prompt token plus
    /// the requested completion budget.
    pub fn estimate_tokens(&self) -> u64 {
        let prompt = (self.body.len() as u64).div_ceil(4);
        let completion = serde_json::from_slice::<serde_json::Value>(&self.body)
            .ok()
            .and_then(|v| v.get("max_tokens").and_then(|m| m.as_u64()))
            .unwrap_or(0);
        prompt.saturating_add(completion)
    }
}

fn extract_model(body: &Bytes) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()?
        .get("model")?
        .as_str()
        .map(str::to_string)
}

/// Buffered upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    /// `usage.total_tokens` from an OpenAI-style JSON body.
    pub fn total_tokens(&self) -> Option<u64> {
        let value: serde_json::Value = serde_json::from_slice(&self.body).ok()?;
        let usage = value.get("usage")?;
        usage.get("total_tokens").and_then(|t| t.as_u64()).or_else(|| {
            let prompt = usage.get("prompt_tokens").and_then(|t| t.as_u64())?;
            let completion = usage.get("completion_tokens").and_then(|t| t.as_u64()).unwrap_or(0);
            Some(prompt + completion)
        })
    }

    pub fn content_type(&self) -> Option<String> {
        self.headers
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

/// Result of a balance/health query for one key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalanceReport {
    /// Total spendable balance.
    pub balance: f64,
    /// Paid portion of the balance, when the provider reports it.
    pub charge_balance: Option<f64>,
    /// `false` when the provider rejected the credential.
    pub healthy: bool,
}

impl BalanceReport {
    pub fn unhealthy() -> Self {
        Self {
            balance: 0.0,
            charge_balance: None,
            healthy: false,
        }
    }

    /// A key with no paid balance is a free-tier key.
    pub fn is_free(&self) -> bool {
        self.charge_balance.is_some_and(|c| c <= 0.0)
    }
}

/// Failure to obtain any HTTP response from the provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("upstream request timed out")]
    Timeout,
    #[error("connection to upstream failed: {0}")]
    Connect(String),
    #[error("upstream transport error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

/// The provider API as seen by the engine.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn balance_query(&self, key: &str) -> Result<BalanceReport>;

    async fn forward_request(
        &self,
        key: &str,
        request: &ForwardRequest,
    ) -> std::result::Result<UpstreamResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_is_read_from_json_body() {
        let req = ForwardRequest::new(
            Method::POST,
            "/v1/chat/completions",
            HeaderMap::new(),
            Bytes::from_static(br#"{"model":"deepseek-ai/DeepSeek-V3","max_tokens":100}"#),
        );
        assert_eq!(req.model.as_deref(), Some("deepseek-ai/DeepSeek-V3"));
        assert!(req.estimate_tokens() > 100);
    }

    #[test]
    fn non_json_body_has_no_model() {
        let req = ForwardRequest::new(Method::GET, "/v1/models", HeaderMap::new(), Bytes::new());
        assert_eq!(req.model, None);
        assert_eq!(req.estimate_tokens(), 0);
    }

    #[test]
    fn usage_tokens_fall_back_to_parts() {
        let resp = UpstreamResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(br#"{"usage":{"prompt_tokens":12,"completion_tokens":30}}"#),
        };
        assert_eq!(resp.total_tokens(), Some(42));
    }

    #[test]
    fn zero_charge_balance_is_free_tier() {
        let report = BalanceReport {
            balance: 14.0,
            charge_balance: Some(0.0),
            healthy: true,
        };
        assert!(report.is_free());
    }
}
