// src/storage/memory.rs

use crate::error::Result;
use crate::pool::{KeyRecord, StrategyConfig};
use crate::storage::KeyPersistence;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::trace;

/// In-memory persistence; state lives as long as the process.
#[derive(Debug, Default, Clone)]
pub struct InMemoryPersistence {
    keys: Arc<RwLock<Vec<KeyRecord>>>,
    strategy: Arc<RwLock<Option<StrategyConfig>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keys(records: Vec<KeyRecord>) -> Self {
        Self {
            keys: Arc::new(RwLock::new(records)),
            strategy: Arc::default(),
        }
    }

    pub async fn set_strategy_config(&self, config: StrategyConfig) {
        *self.strategy.write().await = Some(config);
    }

    /// Snapshot of what was last saved.
    pub async fn saved(&self) -> Vec<KeyRecord> {
        self.keys.read().await.clone()
    }
}

#[async_trait]
impl KeyPersistence for InMemoryPersistence {
    async fn load_keys(&self) -> Result<Vec<KeyRecord>> {
        trace!("InMemoryPersistence::load_keys: waiting for read lock");
        let guard = self.keys.read().await;
        Ok(guard.clone())
    }

    async fn save_keys(&self, records: &[KeyRecord]) -> Result<()> {
        trace!("InMemoryPersistence::save_keys: waiting for write lock");
        let mut guard = self.keys.write().await;
        *guard = records.to_vec();
        Ok(())
    }

    async fn load_strategy_config(&self) -> Result<Option<StrategyConfig>> {
        Ok(self.strategy.read().await.clone())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
