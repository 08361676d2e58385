// src/config/validation.rs

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::pool::preview_key;
use std::collections::HashSet;
use tracing::{debug, warn};
use url::Url;

pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &AppConfig) -> Result<()> {
        debug!("Starting configuration validation");

        if let Err(e) = Self::validate_server_config(config) {
            warn!("Server config validation failed: {}", e);
            return Err(e);
        }
        if let Err(e) = Self::validate_upstream(config) {
            warn!("Upstream config validation failed: {}", e);
            return Err(e);
        }
        if let Err(e) = Self::validate_pool(config) {
            warn!("Pool config validation failed: {}", e);
            return Err(e);
        }
        if let Err(e) = Self::validate_refresh_and_dispatch(config) {
            warn!("Refresh/dispatch config validation failed: {}", e);
            return Err(e);
        }
        if let Err(e) = Self::validate_keys(config) {
            warn!("API key validation failed: {}", e);
            return Err(e);
        }
        if let Some(redis_url) = &config.storage.redis_url {
            Self::validate_url(redis_url, "storage.redis_url")?;
        }

        debug!("Configuration validation completed successfully");
        Ok(())
    }

    fn validate_server_config(config: &AppConfig) -> Result<()> {
        if config.server.connect_timeout_secs == 0 {
            return Err(AppError::config_validation(
                "Connect timeout cannot be 0",
                Some("server.connect_timeout_secs"),
            ));
        }
        if config.server.request_timeout_secs == 0 {
            return Err(AppError::config_validation(
                "Request timeout cannot be 0",
                Some("server.request_timeout_secs"),
            ));
        }
        Ok(())
    }

    fn validate_upstream(config: &AppConfig) -> Result<()> {
        Self::validate_url(&config.upstream.base_url, "upstream.base_url")?;
        if !config.upstream.balance_path.starts_with('/') {
            return Err(AppError::config_validation(
                "Balance path must start with '/'",
                Some("upstream.balance_path"),
            ));
        }
        if let Some(proxy_url) = &config.upstream.proxy_url {
            let url = Url::parse(proxy_url).map_err(|e| {
                AppError::config_validation(
                    format!("Invalid proxy URL: {} - {}", proxy_url, e),
                    Some("upstream.proxy_url"),
                )
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(AppError::config_validation(
                    format!("Unsupported proxy scheme '{}'. Supported: http, https", url.scheme()),
                    Some("upstream.proxy_url"),
                ));
            }
        }
        Ok(())
    }

    fn validate_pool(config: &AppConfig) -> Result<()> {
        let pool = &config.pool;
        if pool.failure_threshold == 0 {
            return Err(AppError::config_validation(
                "Failure threshold must be at least 1",
                Some("pool.failure_threshold"),
            ));
        }
        if pool.base_backoff_secs > pool.max_backoff_secs {
            return Err(AppError::config_validation(
                "Base backoff cannot exceed max backoff",
                Some("pool.base_backoff_secs"),
            ));
        }
        if pool.rpm_limit == Some(0) || pool.tpm_limit == Some(0) {
            return Err(AppError::config_validation(
                "RPM/TPM limits must be positive when set",
                Some("pool.rpm_limit"),
            ));
        }
        let score = &pool.score;
        if score.success_weight < 0.0 || score.latency_weight < 0.0 {
            return Err(AppError::config_validation(
                "Score weights cannot be negative",
                Some("pool.score"),
            ));
        }
        if !(0.0..=1.0).contains(&score.recency_weight) || !(score.ewma_alpha > 0.0 && score.ewma_alpha <= 1.0) {
            return Err(AppError::config_validation(
                "recency_weight must be in [0, 1] and ewma_alpha in (0, 1]",
                Some("pool.score"),
            ));
        }
        Ok(())
    }

    fn validate_refresh_and_dispatch(config: &AppConfig) -> Result<()> {
        if config.refresh.concurrency == 0 {
            return Err(AppError::config_validation(
                "Refresh concurrency must be at least 1",
                Some("refresh.concurrency"),
            ));
        }
        if config.refresh.interval_secs == 0 {
            return Err(AppError::config_validation(
                "Refresh interval cannot be 0",
                Some("refresh.interval_secs"),
            ));
        }
        if !(0.0..=1.0).contains(&config.refresh.max_failure_ratio) {
            return Err(AppError::config_validation(
                "max_failure_ratio must be between 0 and 1",
                Some("refresh.max_failure_ratio"),
            ));
        }
        if config.dispatch.max_key_fault_attempts == 0 || config.dispatch.max_reselect_attempts == 0 {
            return Err(AppError::config_validation(
                "Dispatch attempt budgets must be at least 1",
                Some("dispatch"),
            ));
        }
        if config.storage.persist_interval_secs == 0 {
            return Err(AppError::config_validation(
                "Persist interval cannot be 0",
                Some("storage.persist_interval_secs"),
            ));
        }
        Ok(())
    }

    fn validate_keys(config: &AppConfig) -> Result<()> {
        let mut seen = HashSet::new();
        for key in &config.api_keys {
            if key.trim().is_empty() {
                return Err(AppError::config_validation("API keys cannot be empty", Some("api_keys")));
            }
            if !seen.insert(key) {
                return Err(AppError::config_validation(
                    format!("Duplicate API key: {}", preview_key(key)),
                    Some("api_keys"),
                ));
            }
        }
        if config.api_keys.is_empty() {
            warn!("No seed API keys configured; pool starts from persisted state only");
        }
        Ok(())
    }

    fn validate_url(url_str: &str, field_name: &str) -> Result<()> {
        Url::parse(url_str).map_err(|e| {
            AppError::config_validation(
                format!("Invalid URL in {}: {} - {}", field_name, url_str, e),
                Some(field_name),
            )
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ConfigValidator::validate(&AppConfig::default()).is_ok());
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let mut config = AppConfig::default();
        config.api_keys = vec!["sk-dup-0000000001".into(), "sk-dup-0000000001".into()];
        assert!(matches!(
            ConfigValidator::validate(&config),
            Err(AppError::ConfigValidation { .. })
        ));
    }

    #[test]
    fn socks_proxy_is_rejected() {
        let mut config = AppConfig::default();
        config.upstream.proxy_url = Some("socks5://127.0.0.1:1080".into());
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let mut config = AppConfig::default();
        config.pool.failure_threshold = 0;
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn port_zero_is_accepted() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(ConfigValidator::validate(&config).is_ok());
    }
}
