// src/refresher.rs

use crate::error::{AppError, Result};
use crate::metrics;
use crate::pool::{preview_key, KeyFilter, KeyRecord, KeyStore};
use crate::upstream::UpstreamClient;
use futures_util::{stream, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub interval: Duration,
    /// Upper bound on concurrent balance queries.
    pub concurrency: usize,
    pub max_failure_ratio: f64,
    pub timeout: Duration,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            concurrency: 4,
            max_failure_ratio: 0.5,
            timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub total: usize,
    pub refreshed: usize,
    pub failed: usize,
}

/// Queries balance and liveness for every key and writes the results into the store.
pub struct Refresher {
    store: Arc<KeyStore>,
    upstream: Arc<dyn UpstreamClient>,
    settings: RefreshSettings,
}

impl Refresher {
    pub fn new(store: Arc<KeyStore>, upstream: Arc<dyn UpstreamClient>, settings: RefreshSettings) -> Self {
        Self {
            store,
            upstream,
            settings,
        }
    }

    /// Refreshes one key. A failed query demotes the key and is returned to the caller.
    pub async fn refresh_key(&self, id: &str) -> Result<KeyRecord> {
        let query = tokio::time::timeout(self.settings.timeout, self.upstream.balance_query(id)).await;
        let report = match query {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                self.store.mark_refresh_failed(id)?;
                return Err(e);
            }
            Err(_) => {
                self.store.mark_refresh_failed(id)?;
                return Err(AppError::UpstreamTransport {
                    message: format!("balance query timed out after {:?}", self.settings.timeout),
                });
            }
        };

        let record = self
            .store
            .apply_refresh(id, report.balance, report.is_free(), report.healthy)?;
        debug!(
            key.preview = %preview_key(id),
            balance = record.balance,
            free = record.is_free,
            status = %record.status,
            "Key refreshed"
        );
        Ok(record)
    }

    /// One pass over the pool with bounded concurrency. Per-key failures are logged and counted.
    #[instrument(skip(self), fields(concurrency = self.settings.concurrency))]
    pub async fn refresh_all(&self) -> RefreshSummary {
        let ids: Vec<String> = self.store.list(KeyFilter::All).into_iter().map(|r| r.id).collect();
        let total = ids.len();

        let failed = stream::iter(ids)
            .map(|id| async move {
                let result = self.refresh_key(&id).await;
                (id, result)
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .fold(0usize, |failed, (id, result)| async move {
                metrics::record_refresh(result.is_ok());
                match result {
                    Ok(_) => failed,
                    Err(e) => {
                        warn!(key.preview = %preview_key(&id), error = %e, "Balance refresh failed");
                        failed + 1
                    }
                }
            })
            .await;

        let summary = RefreshSummary {
            total,
            refreshed: total - failed,
            failed,
        };
        metrics::record_pool_stats(&self.store.stats());
        info!(total = summary.total, refreshed = summary.refreshed, failed = summary.failed, "Refresh pass complete");
        summary
    }

    /// Synchronous full pass. Fails when more than `max_failure_ratio` of keys
    /// fail; successful refreshes are kept either way.
    pub async fn force_refresh_all(&self) -> Result<RefreshSummary> {
        let summary = self.refresh_all().await;
        if summary.total > 0 {
            let ratio = summary.failed as f64 / summary.total as f64;
            if ratio > self.settings.max_failure_ratio {
                return Err(AppError::RefreshFailed {
                    failed: summary.failed,
                    total: summary.total,
                });
            }
        }
        Ok(summary)
    }

    /// Periodic refresh until `cancel` fires. The first pass runs one interval from now.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.settings.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "Balance refresher started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Balance refresher received cancel signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        // A pass in progress is abandoned on shutdown
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = self.refresh_all() => {}
                        }
                    }
                }
            }
        })
    }
}
