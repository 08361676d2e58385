// src/config/mod.rs

pub mod app;
pub mod loader;
pub mod validation;

pub use app::{
    AppConfig, DispatchConfig, PoolConfig, RefreshConfig, ServerConfig, StorageConfig, UpstreamConfig,
};
pub use loader::{load_config, override_with_env};
pub use validation::ConfigValidator;
