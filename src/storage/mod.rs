// src/storage/mod.rs

pub mod json_file;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod traits;

pub use json_file::JsonFilePersistence;
pub use memory::InMemoryPersistence;
#[cfg(feature = "redis")]
pub use self::redis::RedisPersistence;
pub use traits::KeyPersistence;

use crate::config::StorageConfig;
use crate::error::Result;
use std::sync::Arc;
use tracing::warn;

/// Picks the backend from configuration: Redis, then the JSON file, then memory.
pub fn from_config(config: &StorageConfig) -> Result<Arc<dyn KeyPersistence>> {
    if let Some(url) = config.redis_url.as_deref() {
        #[cfg(feature = "redis")]
        {
            return Ok(Arc::new(RedisPersistence::connect(url, config.redis_key_prefix.clone())?));
        }
        #[cfg(not(feature = "redis"))]
        warn!(redis_url = %url, "Redis URL configured but the `redis` feature is disabled; falling back");
    }
    if let Some(path) = config.keys_file.as_ref() {
        return Ok(Arc::new(JsonFilePersistence::new(path.clone())));
    }
    warn!("No persistence configured; key state will not survive restarts");
    Ok(Arc::new(InMemoryPersistence::new()))
}
