// src/config/loader.rs

use crate::config::{AppConfig, ConfigValidator};
use crate::error::{AppError, Result};
use crate::pool::Strategy;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Load configuration from file, then apply environment overrides and validate
pub fn load_config(config_path: &Path) -> Result<AppConfig> {
    let mut config = if config_path.exists() {
        info!("Loading configuration from file: {}", config_path.display());
        load_from_file(config_path)?
    } else {
        info!("Configuration file not found, using defaults");
        AppConfig::default()
    };

    override_with_env(&mut config, |name| std::env::var(name).ok());

    ConfigValidator::validate(&config)?;

    debug!("Configuration loaded and validated successfully");
    Ok(config)
}

fn load_from_file(config_path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(config_path).map_err(|_| AppError::ConfigNotFound {
        path: config_path.display().to_string(),
    })?;

    serde_yaml::from_str(&content).map_err(|e| AppError::ConfigParse {
        message: format!("Failed to parse config file: {}", e),
    })
}

/// Applies `PORT`, `KEYPOOL_*` and `REDIS_URL` overrides. `lookup` is the env source.
pub fn override_with_env(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(port_str) = lookup("PORT") {
        match port_str.parse::<u16>() {
            Ok(port) => {
                info!("Overriding server port from environment variable: {}", port);
                config.server.port = port;
            }
            Err(_) => warn!("Invalid PORT environment variable: {}", port_str),
        }
    }

    if let Some(url) = lookup("KEYPOOL_UPSTREAM_URL") {
        info!("Overriding upstream base URL from environment variable");
        config.upstream.base_url = url;
    }

    if let Some(keys) = lookup("KEYPOOL_API_KEYS") {
        let extra: Vec<String> = keys
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();
        info!("Adding {} API keys from environment variable", extra.len());
        for key in extra {
            if !config.api_keys.contains(&key) {
                config.api_keys.push(key);
            }
        }
    }

    if let Some(raw) = lookup("KEYPOOL_DEFAULT_STRATEGY") {
        match raw.parse::<Strategy>() {
            Ok(strategy) => {
                info!("Overriding default strategy from environment: {}", strategy);
                config.strategy.default = strategy;
            }
            Err(e) => warn!("Invalid KEYPOOL_DEFAULT_STRATEGY environment variable: {}", e),
        }
    }

    if let Some(path) = lookup("KEYPOOL_KEYS_FILE") {
        config.storage.keys_file = Some(PathBuf::from(path));
    }

    if let Some(redis_url) = lookup("REDIS_URL") {
        info!("Overriding Redis URL from environment variable");
        config.storage.redis_url = Some(redis_url);
    }

    if let Some(token) = lookup("KEYPOOL_ADMIN_TOKEN").filter(|t| !t.is_empty()) {
        config.server.admin_token = Some(token);
    }
}
