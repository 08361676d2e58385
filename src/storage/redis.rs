// src/storage/redis.rs

use crate::error::Result;
use crate::pool::{KeyRecord, StrategyConfig};
use crate::storage::KeyPersistence;
use async_trait::async_trait;
use deadpool_redis::{Config as RedisConfig, Pool, Runtime};
use redis::AsyncCommands;
use tracing::{info, trace};

const KEYS_FIELD: &str = "keys";
const STRATEGY_FIELD: &str = "strategy";

/// Redis persistence: the pool is one JSON value under `{prefix}:keys`,
/// the strategy table one under `{prefix}:strategy`.
pub struct RedisPersistence {
    pool: Pool,
    key_prefix: String,
}

impl RedisPersistence {
    pub fn connect(redis_url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let pool = RedisConfig::from_url(redis_url).create_pool(Some(Runtime::Tokio1))?;
        let key_prefix = key_prefix.into();
        info!(prefix = %key_prefix, "Using Redis key persistence");
        Ok(Self { pool, key_prefix })
    }

    fn prefix_key(&self, field: &str) -> String {
        format!("{}:{}", self.key_prefix.trim_end_matches(':'), field)
    }
}

#[async_trait]
impl KeyPersistence for RedisPersistence {
    async fn load_keys(&self) -> Result<Vec<KeyRecord>> {
        let mut conn = self.pool.get().await?;
        let raw: Option<String> = conn.get(self.prefix_key(KEYS_FIELD)).await?;
        trace!(present = raw.is_some(), "Loaded key snapshot from Redis");
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save_keys(&self, records: &[KeyRecord]) -> Result<()> {
        let payload = serde_json::to_string(records)?;
        let mut conn = self.pool.get().await?;
        let _: () = conn.set(self.prefix_key(KEYS_FIELD), payload).await?;
        trace!(count = records.len(), "Saved key snapshot to Redis");
        Ok(())
    }

    async fn load_strategy_config(&self) -> Result<Option<StrategyConfig>> {
        let mut conn = self.pool.get().await?;
        let raw: Option<String> = conn.get(self.prefix_key(STRATEGY_FIELD)).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(Into::into))
            .transpose()
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
