// src/key_manager.rs

use crate::clock::SharedClock;
use crate::config::AppConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{AppError, Result};
use crate::pool::{
    preview_key, DisableReason, KeyFilter, KeyRecord, KeyStatus, KeyStore, PoolStats, RateLimiter,
    Selector, StrategyConfig, DEFAULT_MODEL_KEY,
};
use crate::refresher::{RefreshSettings, RefreshSummary, Refresher};
use crate::storage::KeyPersistence;
use crate::upstream::UpstreamClient;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Admin-facing view of one key. The credential is only shown as a preview.
#[derive(Debug, Clone, Serialize)]
pub struct KeyView {
    pub key: String,
    pub status: KeyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_reason: Option<DisableReason>,
    pub balance: f64,
    pub is_free: bool,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub score: f64,
    pub avg_latency_ms: f64,
    pub total_tokens: u64,
    pub rpm: u64,
    pub tpm: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub disabled_until: Option<DateTime<Utc>>,
}

impl KeyView {
    pub fn from_record(record: &KeyRecord, now: DateTime<Utc>) -> Self {
        Self {
            key: preview_key(&record.id),
            status: record.status,
            disable_reason: record.disable_reason,
            balance: record.balance,
            is_free: record.is_free,
            success_count: record.success_count,
            failure_count: record.failure_count,
            consecutive_failures: record.consecutive_failures,
            success_rate: record.success_rate(),
            score: record.score(),
            avg_latency_ms: record.avg_latency_ms,
            total_tokens: record.total_tokens,
            rpm: record.current_rpm(now),
            tpm: record.current_tpm(now),
            last_used_at: record.last_used_at,
            last_refreshed_at: record.last_refreshed_at,
            disabled_until: record.disabled_until,
        }
    }
}

/// Owns the pool for the lifetime of the process: loads it, keeps it fresh,
/// hands out the dispatcher and flushes it back to persistence on stop.
pub struct KeyManager {
    config: Arc<AppConfig>,
    store: Arc<KeyStore>,
    dispatcher: RwLock<Dispatcher>,
    refresher: Arc<Refresher>,
    persistence: Arc<dyn KeyPersistence>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl KeyManager {
    pub fn new(
        config: Arc<AppConfig>,
        upstream: Arc<dyn UpstreamClient>,
        persistence: Arc<dyn KeyPersistence>,
        clock: SharedClock,
    ) -> Self {
        let store = Arc::new(KeyStore::new(config.pool.store_settings(), clock));
        let limiter = RateLimiter::new(Arc::clone(&store), config.pool.rate_limits());
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            limiter,
            Selector::new(config.pool.low_balance_floor),
            Arc::new(config.strategy.clone()),
            Arc::clone(&upstream),
            config.dispatch.settings(),
        );
        let refresher = Arc::new(Refresher::new(
            Arc::clone(&store),
            upstream,
            RefreshSettings {
                interval: Duration::from_secs(config.refresh.interval_secs.max(1)),
                concurrency: config.refresh.concurrency,
                max_failure_ratio: config.refresh.max_failure_ratio,
                timeout: Duration::from_secs(config.refresh.timeout_secs),
            },
        ));

        Self {
            config,
            store,
            dispatcher: RwLock::new(dispatcher),
            refresher,
            persistence,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<KeyStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.read().clone()
    }

    pub fn strategies(&self) -> StrategyConfig {
        self.dispatcher.read().strategies().clone()
    }

    /// Loads the pool, seeds configured keys, refreshes everything once and
    /// starts the background loops. A failed initial refresh is logged only.
    #[instrument(skip(self), fields(backend = self.persistence.backend_name()))]
    pub async fn start(&self) -> Result<()> {
        let persisted = self.persistence.load_keys().await?;
        let loaded = persisted.len();
        for record in persisted {
            self.store.upsert(record);
        }

        let mut seeded = 0usize;
        for key in self.config.api_keys.iter().map(|k| k.trim()).filter(|k| !k.is_empty()) {
            if self.store.insert_if_absent(KeyRecord::new(key)) {
                seeded += 1;
            }
        }
        info!(loaded, seeded, total = self.store.len(), "Key pool loaded");

        if let Some(persisted) = self.persistence.load_strategy_config().await? {
            let mut strategies = self.config.strategy.clone();
            strategies.default = persisted.default;
            strategies.models.extend(persisted.models);
            let mut dispatcher = self.dispatcher.write();
            *dispatcher = dispatcher.with_strategies(Arc::new(strategies));
            debug!("Applied persisted strategy table");
        }

        if let Err(e) = self.force_refresh_all_keys_balance().await {
            warn!(error = %e, "Initial balance refresh incomplete, continuing with current pool state");
        }

        self.spawn_background_tasks();
        Ok(())
    }

    fn spawn_background_tasks(&self) {
        let refresher = Arc::clone(&self.refresher).spawn(self.cancel.child_token());

        let store = Arc::clone(&self.store);
        let persistence = Arc::clone(&self.persistence);
        let cancel = self.cancel.child_token();
        let period = Duration::from_secs(self.config.storage.persist_interval_secs.max(1));
        let housekeeping = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Housekeeping task received cancel signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let reactivated = store.reactivate_expired();
                        if reactivated > 0 {
                            info!(reactivated, "Re-activated keys after cooldown");
                        }
                        if let Err(e) = persistence.save_keys(&store.list(KeyFilter::All)).await {
                            warn!(error = %e, "Periodic key save failed");
                        }
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.push(("refresher", refresher));
        tasks.push(("housekeeping", housekeeping));
    }

    /// Stops the background loops, waits up to the shutdown grace for
    /// in-flight requests, then flushes the pool.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        let grace = Duration::from_secs(self.config.server.shutdown_grace_secs);
        info!("Initiating graceful shutdown of key manager...");
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for (name, handle) in tasks {
            let abort = handle.abort_handle();
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => debug!(task = name, "Background task completed"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Background task ended abnormally"),
                Err(_) => {
                    warn!(task = name, "Background task did not stop in time, aborting");
                    abort.abort();
                }
            }
        }

        let in_flight = Arc::clone(self.dispatcher.read().in_flight());
        if !in_flight.wait_idle(grace).await {
            warn!(remaining = in_flight.count(), "Abandoning in-flight requests after grace period");
        }

        if let Err(e) = self.save().await {
            error!(error = %e, "Final key save failed");
            return Err(e);
        }
        info!(keys = self.store.len(), "Key state flushed");
        Ok(())
    }

    pub async fn save(&self) -> Result<()> {
        self.persistence.save_keys(&self.store.list(KeyFilter::All)).await
    }

    pub async fn force_refresh_all_keys_balance(&self) -> Result<RefreshSummary> {
        self.refresher.force_refresh_all().await
    }

    /// Adds a key as `Unknown` and refreshes it right away.
    pub async fn add_key(&self, key: &str) -> Result<KeyView> {
        let key = key.trim();
        if key.is_empty() {
            return Err(AppError::validation("key", "must not be empty"));
        }
        if !self.store.insert_if_absent(KeyRecord::new(key)) {
            return Err(AppError::validation("key", "already in the pool"));
        }
        info!(key.preview = %preview_key(key), "Key added");

        if let Err(e) = self.refresher.refresh_key(key).await {
            warn!(key.preview = %preview_key(key), error = %e, "Refresh of new key failed, leaving it unknown");
        }
        let record = self.store.get(key)?;
        Ok(KeyView::from_record(&record, self.store.now()))
    }

    pub fn remove_key(&self, key: &str) -> Result<KeyView> {
        let record = self.store.remove(key)?;
        info!(key.preview = %preview_key(key), "Key removed");
        Ok(KeyView::from_record(&record, self.store.now()))
    }

    pub fn list_keys(&self, filter: KeyFilter) -> Vec<KeyView> {
        let now = self.store.now();
        self.store
            .list(filter)
            .iter()
            .map(|record| KeyView::from_record(record, now))
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        self.store.stats()
    }

    pub fn log_model_strategies(&self) {
        let strategies = self.strategies();
        info!(
            strategy = strategies.default.label(),
            id = strategies.default.id(),
            "Default key selection strategy"
        );
        if strategies.models.is_empty() {
            info!("No per-model strategies configured");
            return;
        }
        for (model, strategy) in &strategies.models {
            let model = if model == DEFAULT_MODEL_KEY { "(all other models)" } else { model.as_str() };
            info!(model, strategy = strategy.label(), id = strategy.id(), "Model strategy");
        }
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("keys", &self.store.len())
            .field("backend", &self.persistence.backend_name())
            .finish()
    }
}
