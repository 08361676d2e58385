// src/upstream/http.rs

use super::{BalanceReport, ForwardRequest, TransportError, UpstreamClient, UpstreamResponse};
use crate::config::UpstreamConfig;
use crate::error::{AppError, Result};
use crate::pool::preview_key;
use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use reqwest::{Client, Proxy};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

// Hop-by-hop headers that should not be forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    // Replaced with the selected key
    "authorization",
    // reqwest negotiates and decodes compression itself
    "accept-encoding",
    "content-length",
];

/// reqwest-backed provider client.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: Client,
    base_url: Url,
    balance_path: String,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig, connect_timeout: Duration, request_timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)?;

        let mut builder = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60));

        if let Some(proxy_url) = config.proxy_url.as_deref() {
            let proxy = Proxy::all(proxy_url).map_err(|e| {
                AppError::config_validation(format!("invalid outbound proxy: {e}"), Some("upstream.proxy_url"))
            })?;
            info!(proxy_url = %proxy_url, "Routing upstream traffic through proxy");
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| AppError::internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            balance_path: config.balance_path.clone(),
        })
    }

    fn target_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url.as_str().trim_end_matches('/'), path_and_query)
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    async fn balance_query(&self, key: &str) -> Result<BalanceReport> {
        let url = self.target_url(&self.balance_path);
        let response = self.client.get(&url).bearer_auth(key).send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(key.preview = %preview_key(key), status = status.as_u16(), "Balance query rejected credential");
            return Ok(BalanceReport::unhealthy());
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(AppError::UpstreamError {
                status: status.as_u16(),
                body,
                content_type,
            });
        }

        let report = parse_balance(&body)?;
        debug!(key.preview = %preview_key(key), balance = report.balance, "Balance query succeeded");
        Ok(report)
    }

    async fn forward_request(
        &self,
        key: &str,
        request: &ForwardRequest,
    ) -> std::result::Result<UpstreamResponse, TransportError> {
        let url = self.target_url(&request.path_and_query);
        let headers = build_forward_headers(&request.headers, key)?;

        debug!(method = %request.method, url = %url, key.preview = %preview_key(key), "Forwarding request to upstream");

        let response = self
            .client
            .request(request.method.clone(), &url)
            .headers(headers)
            .body(request.body.clone())
            .send()
            .await?;

        let status = response.status();
        let headers = filter_hop_by_hop(response.headers());
        let body = response.bytes().await?;

        Ok(UpstreamResponse { status, headers, body })
    }
}

fn build_forward_headers(original: &HeaderMap, key: &str) -> std::result::Result<HeaderMap, TransportError> {
    let mut headers = filter_hop_by_hop(original);
    let auth = HeaderValue::from_str(&format!("Bearer {key}"))
        .map_err(|e| TransportError::Other(format!("key is not a valid header value: {e}")))?;
    headers.insert(header::AUTHORIZATION, auth);
    Ok(headers)
}

fn filter_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP_HEADERS.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Reads `data.totalBalance` (or `data.balance`) and `data.chargeBalance`,
/// accepting numbers or numeric strings.
fn parse_balance(body: &[u8]) -> Result<BalanceReport> {
    let value: Value = serde_json::from_slice(body)?;
    let data = value.get("data").unwrap_or(&value);

    let balance = ["totalBalance", "total_balance", "balance"]
        .iter()
        .find_map(|field| data.get(*field).and_then(as_f64))
        .ok_or_else(|| AppError::UpstreamTransport {
            message: "balance response carries no balance field".to_string(),
        })?;
    let charge_balance = ["chargeBalance", "charge_balance"]
        .iter()
        .find_map(|field| data.get(*field).and_then(as_f64));

    Ok(BalanceReport {
        balance,
        charge_balance,
        healthy: true,
    })
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
