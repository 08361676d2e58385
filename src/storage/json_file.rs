// src/storage/json_file.rs

use crate::error::{AppError, Result};
use crate::pool::{KeyRecord, StrategyConfig};
use crate::storage::KeyPersistence;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    keys: Vec<KeyRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    strategy: Option<StrategyConfig>,
}

/// Pool snapshot in a single JSON file, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_snapshot(&self) -> Result<Snapshot> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Snapshot::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Key file not found, starting empty");
                Ok(Snapshot::default())
            }
            Err(e) => Err(AppError::Io {
                operation: "read_keys_file".to_string(),
                message: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl KeyPersistence for JsonFilePersistence {
    async fn load_keys(&self) -> Result<Vec<KeyRecord>> {
        let snapshot = self.read_snapshot().await?;
        info!(path = %self.path.display(), count = snapshot.keys.len(), "Loaded keys from file");
        Ok(snapshot.keys)
    }

    async fn save_keys(&self, records: &[KeyRecord]) -> Result<()> {
        // Keep whatever strategy table is already on disk
        let strategy = self.read_snapshot().await.ok().and_then(|s| s.strategy);
        let snapshot = Snapshot {
            keys: records.to_vec(),
            strategy,
        };
        let payload = serde_json::to_vec_pretty(&snapshot)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomically(&path, &payload)).await??;
        debug!(path = %self.path.display(), count = records.len(), "Saved keys to file");
        Ok(())
    }

    async fn load_strategy_config(&self) -> Result<Option<StrategyConfig>> {
        Ok(self.read_snapshot().await?.strategy)
    }

    fn backend_name(&self) -> &'static str {
        "json_file"
    }
}

fn write_atomically(path: &Path, payload: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(payload)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| AppError::Io {
        operation: "persist_keys_file".to_string(),
        message: e.to_string(),
    })?;
    Ok(())
}
