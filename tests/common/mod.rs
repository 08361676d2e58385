//! Common test utilities and fixtures
#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use keypool_proxy::clock::{ManualClock, SharedClock};
use keypool_proxy::config::AppConfig;
use keypool_proxy::dispatcher::{DispatchSettings, Dispatcher};
use keypool_proxy::error::{AppError, Result};
use keypool_proxy::pool::{
    KeyRecord, KeyStatus, KeyStore, RateLimiter, RateLimits, Selector, StoreSettings, Strategy,
    StrategyConfig,
};
use keypool_proxy::upstream::{
    BalanceReport, ForwardRequest, TransportError, UpstreamClient, UpstreamResponse,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const OK_BODY: &str = r#"{"id":"cmpl-1","choices":[],"usage":{"prompt_tokens":12,"completion_tokens":30,"total_tokens":42}}"#;

/// Test configuration builder
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.server.port = 0;
        config.server.shutdown_grace_secs = 1;
        config.storage.keys_file = None;
        config.dispatch.transient_backoff_ms = 1;
        Self { config }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_keys.push(key.into());
        self
    }

    pub fn with_default_strategy(mut self, strategy: Strategy) -> Self {
        self.config.strategy.default = strategy;
        self
    }

    pub fn with_model_strategy(mut self, model: &str, strategy: Strategy) -> Self {
        self.config.strategy.models.insert(model.to_string(), strategy);
        self
    }

    pub fn with_admin_token(mut self, token: &str) -> Self {
        self.config.server.admin_token = Some(token.to_string());
        self
    }

    pub fn with_rpm_limit(mut self, rpm: u64) -> Self {
        self.config.pool.rpm_limit = Some(rpm);
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Canned upstream behaviour for one key.
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16, String),
    StatusWithHeaders(u16, String, Vec<(&'static str, &'static str)>),
    Transport(TransportError),
    /// Never completes.
    Hang,
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Status(200, OK_BODY.to_string())
    }
}

/// In-process upstream with per-key scripted replies and balances.
#[derive(Debug)]
pub struct ScriptedUpstream {
    replies: Mutex<HashMap<String, Vec<Reply>>>,
    default_reply: Mutex<Reply>,
    balances: Mutex<HashMap<String, std::result::Result<BalanceReport, String>>>,
    forward_log: Mutex<Vec<String>>,
    balance_calls: AtomicUsize,
}

impl Default for ScriptedUpstream {
    fn default() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            default_reply: Mutex::new(Reply::ok()),
            balances: Mutex::new(HashMap::new()),
            forward_log: Mutex::new(Vec::new()),
            balance_calls: AtomicUsize::new(0),
        }
    }
}

impl ScriptedUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every request with `key` gets `reply`.
    pub fn reply_for(&self, key: &str, reply: Reply) {
        self.replies.lock().insert(key.to_string(), vec![reply]);
    }

    /// Replies consumed in order; the last one repeats.
    pub fn sequence_for(&self, key: &str, replies: Vec<Reply>) {
        self.replies.lock().insert(key.to_string(), replies);
    }

    pub fn set_default_reply(&self, reply: Reply) {
        *self.default_reply.lock() = reply;
    }

    pub fn balance_for(&self, key: &str, balance: f64, charge_balance: Option<f64>) {
        self.balances.lock().insert(
            key.to_string(),
            Ok(BalanceReport {
                balance,
                charge_balance,
                healthy: true,
            }),
        );
    }

    pub fn unhealthy(&self, key: &str) {
        self.balances.lock().insert(key.to_string(), Ok(BalanceReport::unhealthy()));
    }

    pub fn balance_error(&self, key: &str) {
        self.balances
            .lock()
            .insert(key.to_string(), Err("balance endpoint unavailable".to_string()));
    }

    pub fn forwarded_keys(&self) -> Vec<String> {
        self.forward_log.lock().clone()
    }

    pub fn balance_calls(&self) -> usize {
        self.balance_calls.load(Ordering::SeqCst)
    }

    fn next_reply(&self, key: &str) -> Reply {
        let mut replies = self.replies.lock();
        match replies.get_mut(key) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => self.default_reply.lock().clone(),
        }
    }
}

#[async_trait]
impl UpstreamClient for ScriptedUpstream {
    async fn balance_query(&self, key: &str) -> Result<BalanceReport> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.balances.lock().get(key).cloned();
        match scripted {
            Some(Ok(report)) => Ok(report),
            Some(Err(message)) => Err(AppError::UpstreamTransport { message }),
            None => Ok(BalanceReport {
                balance: 10.0,
                charge_balance: Some(10.0),
                healthy: true,
            }),
        }
    }

    async fn forward_request(
        &self,
        key: &str,
        _request: &ForwardRequest,
    ) -> std::result::Result<UpstreamResponse, TransportError> {
        self.forward_log.lock().push(key.to_string());
        let reply = self.next_reply(key);
        match reply {
            Reply::Status(status, body) => Ok(response(status, &body, &[])),
            Reply::StatusWithHeaders(status, body, headers) => Ok(response(status, &body, &headers)),
            Reply::Transport(err) => Err(err),
            Reply::Hang => std::future::pending().await,
        }
    }
}

pub fn response(status: u16, body: &str, headers: &[(&'static str, &'static str)]) -> UpstreamResponse {
    let mut map = HeaderMap::new();
    map.insert("content-type", HeaderValue::from_static("application/json"));
    for (name, value) in headers {
        map.insert(*name, HeaderValue::from_static(*value));
    }
    UpstreamResponse {
        status: StatusCode::from_u16(status).unwrap(),
        headers: map,
        body: Bytes::from(body.to_string()),
    }
}

pub fn chat_request(model: &str) -> ForwardRequest {
    let body = format!(r#"{{"model":"{model}","messages":[{{"role":"user","content":"hi"}}],"max_tokens":16}}"#);
    ForwardRequest::new(
        axum::http::Method::POST,
        "/v1/chat/completions",
        HeaderMap::new(),
        Bytes::from(body),
    )
}

pub fn manual_clock() -> (ManualClock, SharedClock) {
    let clock = ManualClock::default();
    let shared: SharedClock = Arc::new(clock.clone());
    (clock, shared)
}

pub fn active(id: &str) -> KeyRecord {
    KeyRecord::new(id).with_status(KeyStatus::Active).with_balance(10.0)
}

/// Store seeded with `records` on a manual clock.
pub fn store_with(records: Vec<KeyRecord>) -> (Arc<KeyStore>, ManualClock) {
    let (clock, shared) = manual_clock();
    let store = Arc::new(KeyStore::new(StoreSettings::default(), shared));
    for record in records {
        store.upsert(record);
    }
    (store, clock)
}

pub fn fast_settings() -> DispatchSettings {
    DispatchSettings {
        max_reselect_attempts: 3,
        max_key_fault_attempts: 3,
        max_transient_retries: 2,
        transient_backoff: Duration::from_millis(1),
    }
}

pub fn dispatcher(
    store: &Arc<KeyStore>,
    upstream: Arc<ScriptedUpstream>,
    strategy: Strategy,
    limits: RateLimits,
    settings: DispatchSettings,
) -> Dispatcher {
    let strategies = StrategyConfig {
        default: strategy,
        ..StrategyConfig::default()
    };
    Dispatcher::new(
        Arc::clone(store),
        RateLimiter::new(Arc::clone(store), limits),
        Selector::default(),
        Arc::new(strategies),
        upstream,
        settings,
    )
}
