// src/storage/traits.rs

use crate::error::Result;
use crate::pool::{KeyRecord, StrategyConfig};
use async_trait::async_trait;

/// Durable home of the key pool. Loads and saves are whole-pool operations.
#[async_trait]
pub trait KeyPersistence: Send + Sync {
    /// All persisted key records, in pool order.
    async fn load_keys(&self) -> Result<Vec<KeyRecord>>;

    /// Replaces the persisted pool with `records`.
    async fn save_keys(&self, records: &[KeyRecord]) -> Result<()>;

    /// Persisted model→strategy table, if one has been stored.
    async fn load_strategy_config(&self) -> Result<Option<StrategyConfig>>;

    /// Human-readable backend name for logs.
    fn backend_name(&self) -> &'static str;
}
