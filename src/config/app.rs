// src/config/app.rs

use crate::dispatcher::DispatchSettings;
use crate::pool::{RateLimits, ScoreWeights, StoreSettings, StrategyConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// How long shutdown waits for in-flight dispatches.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Bearer token required on `/admin` routes. Admin routes are open when unset.
    #[serde(default)]
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
            admin_token: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_balance_path")]
    pub balance_path: String,
    #[serde(default)]
    pub proxy_url: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            balance_path: default_balance_path(),
            proxy_url: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub failure_threshold: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub rate_limit_cooldown_secs: u64,
    pub rpm_limit: Option<u64>,
    pub tpm_limit: Option<u64>,
    pub min_usable_balance: f64,
    pub low_balance_floor: f64,
    pub score: ScoreWeights,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_backoff_secs: 30,
            max_backoff_secs: 1800,
            rate_limit_cooldown_secs: 60,
            rpm_limit: None,
            tpm_limit: None,
            min_usable_balance: 0.0,
            low_balance_floor: 0.0,
            score: ScoreWeights::default(),
        }
    }
}

impl PoolConfig {
    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            failure_threshold: self.failure_threshold,
            base_backoff: Duration::from_secs(self.base_backoff_secs),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
            rate_limit_cooldown: Duration::from_secs(self.rate_limit_cooldown_secs),
            min_usable_balance: self.min_usable_balance,
            weights: self.score,
        }
    }

    pub fn rate_limits(&self) -> RateLimits {
        RateLimits {
            rpm: self.rpm_limit,
            tpm: self.tpm_limit,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub interval_secs: u64,
    pub concurrency: usize,
    /// `force_refresh_all` fails when more than this fraction of keys fail.
    pub max_failure_ratio: f64,
    pub timeout_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            concurrency: 4,
            max_failure_ratio: 0.5,
            timeout_secs: 15,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_reselect_attempts: u32,
    pub max_key_fault_attempts: u32,
    pub max_transient_retries: u32,
    pub transient_backoff_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let defaults = DispatchSettings::default();
        Self {
            max_reselect_attempts: defaults.max_reselect_attempts,
            max_key_fault_attempts: defaults.max_key_fault_attempts,
            max_transient_retries: defaults.max_transient_retries,
            transient_backoff_ms: defaults.transient_backoff.as_millis() as u64,
        }
    }
}

impl DispatchConfig {
    pub fn settings(&self) -> DispatchSettings {
        DispatchSettings {
            max_reselect_attempts: self.max_reselect_attempts,
            max_key_fault_attempts: self.max_key_fault_attempts,
            max_transient_retries: self.max_transient_retries,
            transient_backoff: Duration::from_millis(self.transient_backoff_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON snapshot of the pool. Ignored when `redis_url` is set.
    pub keys_file: Option<PathBuf>,
    pub redis_url: Option<String>,
    pub redis_key_prefix: String,
    pub persist_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            keys_file: Some(PathBuf::from("data/keys.json")),
            redis_url: None,
            redis_key_prefix: "keypool".to_string(),
            persist_interval_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Keys added to the pool on start when not already persisted.
    #[serde(default)]
    pub api_keys: Vec<String>,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    120
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_base_url() -> String {
    "https://api.siliconflow.cn".to_string()
}

fn default_balance_path() -> String {
    "/v1/user/info".to_string()
}
