// src/pool/store.rs

use crate::clock::SharedClock;
use crate::error::{AppError, Result};
use crate::pool::record::{preview_key, DisableReason, KeyRecord, KeyStatus, ScoreWeights};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tunables for the failure policy inside [`KeyStore::record_outcome`].
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub failure_threshold: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Exclusion applied on a provider 429 without `Retry-After`.
    pub rate_limit_cooldown: Duration,
    /// Balances at or below this are treated as exhausted (free-tier keys excepted).
    pub min_usable_balance: f64,
    pub weights: ScoreWeights,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30 * 60),
            rate_limit_cooldown: Duration::from_secs(60),
            min_usable_balance: 0.0,
            weights: ScoreWeights::default(),
        }
    }
}

/// Provider-reported fault that is the key's responsibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFault {
    /// 401/403 or an invalid-credential message.
    Unauthorized,
    /// 402 or an insufficient-balance message.
    QuotaExhausted,
    /// 429 from the provider, with its `Retry-After` if present.
    RateLimited { retry_after: Option<Duration> },
}

/// Which records [`KeyStore::list`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyFilter {
    #[default]
    All,
    Status(KeyStatus),
    /// Keys the selector may pick right now.
    Eligible,
}

/// Aggregate view of the pool for admin and metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub rate_limited: usize,
    pub disabled: usize,
    pub unknown: usize,
    pub eligible: usize,
    pub free_tier: usize,
    pub total_balance: f64,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub tokens: u64,
}

/// Concurrent table of per-key state.
///
/// Every mutation happens under the record's shard lock, so readers never
/// observe a half-applied update. `list` returns owned copies.
#[derive(Debug)]
pub struct KeyStore {
    records: DashMap<String, KeyRecord>,
    next_seq: AtomicU64,
    settings: StoreSettings,
    clock: SharedClock,
}

impl KeyStore {
    pub fn new(settings: StoreSettings, clock: SharedClock) -> Self {
        Self {
            records: DashMap::new(),
            next_seq: AtomicU64::new(0),
            settings,
            clock,
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Snapshot copy ordered by insertion.
    pub fn list(&self, filter: KeyFilter) -> Vec<KeyRecord> {
        let now = self.clock.now();
        let mut out: Vec<KeyRecord> = self
            .records
            .iter()
            .filter(|entry| match filter {
                KeyFilter::All => true,
                KeyFilter::Status(status) => entry.status == status,
                KeyFilter::Eligible => entry.is_eligible(now),
            })
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by_key(|r| r.added_seq);
        out
    }

    pub fn get(&self, id: &str) -> Result<KeyRecord> {
        self.records
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| not_found(id))
    }

    /// Inserts or replaces a record. The score is recomputed and the original
    /// insertion position is kept on replace.
    pub fn upsert(&self, mut record: KeyRecord) {
        record.recompute_score(&self.settings.weights);
        match self.records.get_mut(&record.id) {
            Some(mut existing) => {
                record.added_seq = existing.added_seq;
                *existing = record;
            }
            None => {
                record.added_seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                self.records.insert(record.id.clone(), record);
            }
        }
    }

    /// Inserts only when the id is new. Returns whether it was inserted.
    pub fn insert_if_absent(&self, mut record: KeyRecord) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.records.entry(record.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                record.recompute_score(&self.settings.weights);
                record.added_seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                slot.insert(record);
                true
            }
        }
    }

    pub fn remove(&self, id: &str) -> Result<KeyRecord> {
        self.records
            .remove(id)
            .map(|(_, record)| record)
            .ok_or_else(|| not_found(id))
    }

    /// Runs `f` against one record under its lock and recomputes the score afterwards.
    pub(crate) fn update<R>(&self, id: &str, f: impl FnOnce(&mut KeyRecord, DateTime<Utc>) -> R) -> Result<R> {
        let now = self.clock.now();
        let mut entry = self.records.get_mut(id).ok_or_else(|| not_found(id))?;
        let result = f(entry.value_mut(), now);
        entry.recompute_score(&self.settings.weights);
        Ok(result)
    }

    /// Applies one dispatch outcome atomically: counters, EWMAs, windows, score
    /// and the consecutive-failure policy.
    pub fn record_outcome(
        &self,
        id: &str,
        success: bool,
        tokens_used: u64,
        latency: Duration,
    ) -> Result<KeyRecord> {
        let settings = &self.settings;
        self.update(id, |record, now| {
            let alpha = settings.weights.ewma_alpha.clamp(f64::EPSILON, 1.0);
            let outcome = if success { 1.0 } else { 0.0 };
            record.recent_success = alpha * outcome + (1.0 - alpha) * record.recent_success;

            let latency_ms = latency.as_secs_f64() * 1000.0;
            record.avg_latency_ms = if record.success_count + record.failure_count == 0 {
                latency_ms
            } else {
                alpha * latency_ms + (1.0 - alpha) * record.avg_latency_ms
            };

            record.total_tokens = record.total_tokens.saturating_add(tokens_used);
            record.last_used_at = Some(now);
            record.rpm_window.roll(now);
            record.tpm_window.roll(now);

            if success {
                record.success_count += 1;
                record.consecutive_failures = 0;
                record.disable_count = 0;
                if record.disabled_until.is_some_and(|until| until <= now) {
                    record.disabled_until = None;
                }
                if record.disabled_until.is_none() && record.status != KeyStatus::Active {
                    if record.status == KeyStatus::Disabled && record.disable_reason.is_some() {
                        debug!(key.preview = %preview_key(&record.id), "Key recovered after successful request");
                    }
                    record.status = KeyStatus::Active;
                    record.disable_reason = None;
                }
            } else {
                record.failure_count += 1;
                record.consecutive_failures = record.consecutive_failures.saturating_add(1);
                // Keys disabled until the next healthy refresh stay that way
                let held_for_refresh = record.status == KeyStatus::Disabled && record.disabled_until.is_none();
                if record.consecutive_failures >= settings.failure_threshold
                    && !held_for_refresh
                    && !record.is_cooling_down(now)
                {
                    let backoff = backoff_for(settings, record.disable_count);
                    record.status = KeyStatus::Disabled;
                    record.disable_reason = Some(DisableReason::ConsecutiveFailures);
                    record.disabled_until = Some(deadline(now, backoff));
                    record.disable_count = record.disable_count.saturating_add(1);
                    warn!(
                        key.preview = %preview_key(&record.id),
                        consecutive_failures = record.consecutive_failures,
                        backoff_secs = backoff.num_seconds(),
                        "Key disabled after repeated failures"
                    );
                }
            }
            record.clone()
        })
        .map(|mut record| {
            record.recompute_score(&settings.weights);
            record
        })
    }

    /// Applies a provider-reported key fault on top of `record_outcome`.
    pub fn mark_key_fault(&self, id: &str, fault: KeyFault) -> Result<()> {
        let cooldown = self.settings.rate_limit_cooldown;
        let ceiling = self.settings.max_backoff.max(cooldown);
        self.update(id, |record, now| match fault {
            KeyFault::Unauthorized => {
                record.status = KeyStatus::Disabled;
                record.disable_reason = Some(DisableReason::InvalidCredential);
                record.disabled_until = None;
                warn!(key.preview = %preview_key(&record.id), "Key rejected as invalid, disabling");
            }
            KeyFault::QuotaExhausted => {
                record.status = KeyStatus::Disabled;
                record.disable_reason = Some(DisableReason::BalanceExhausted);
                record.disabled_until = None;
                warn!(key.preview = %preview_key(&record.id), "Key quota exhausted, disabling until next refresh");
            }
            KeyFault::RateLimited { .. } if record.status == KeyStatus::Disabled && record.disabled_until.is_none() => {
                debug!(key.preview = %preview_key(&record.id), "Rate limit on a key held for refresh, ignoring");
            }
            KeyFault::RateLimited { retry_after } => {
                let wait = retry_after.unwrap_or(cooldown).min(ceiling);
                let until = deadline(now, to_chrono(wait));
                // Never shorten an exclusion already in force
                if record.disabled_until.map_or(true, |existing| existing < until) {
                    record.disabled_until = Some(until);
                }
                if record.status != KeyStatus::Disabled {
                    record.status = KeyStatus::RateLimited;
                    record.disable_reason = Some(DisableReason::ProviderRateLimit);
                }
                info!(
                    key.preview = %preview_key(&record.id),
                    retry_after_secs = wait.as_secs(),
                    "Key rate limited by provider"
                );
            }
        })
    }

    /// Applies a successful balance/health query.
    pub fn apply_refresh(&self, id: &str, balance: f64, is_free: bool, healthy: bool) -> Result<KeyRecord> {
        let min_usable = self.settings.min_usable_balance;
        self.update(id, |record, now| {
            record.balance = balance;
            record.is_free = is_free;
            record.last_refreshed_at = Some(now);

            if !healthy {
                record.status = KeyStatus::Disabled;
                record.disable_reason = Some(DisableReason::Unhealthy);
                record.disabled_until = None;
            } else if balance <= min_usable && !is_free {
                record.status = KeyStatus::Disabled;
                record.disable_reason = Some(DisableReason::BalanceExhausted);
                record.disabled_until = None;
            } else if !record.is_cooling_down(now) {
                // Temporary exclusions run out on their own; everything else a
                // healthy refresh can lift.
                record.status = KeyStatus::Active;
                record.disable_reason = None;
                record.disabled_until = None;
            }
            record.clone()
        })
    }

    /// A failed balance query demotes an active key to `Unknown`. Disabled keys stay disabled.
    pub fn mark_refresh_failed(&self, id: &str) -> Result<()> {
        self.update(id, |record, _| {
            if record.status == KeyStatus::Active {
                record.status = KeyStatus::Unknown;
            }
        })
    }

    /// Returns keys whose temporary exclusion has elapsed to `Active`.
    pub fn reactivate_expired(&self) -> usize {
        let now = self.clock.now();
        let mut reactivated = 0;
        for mut entry in self.records.iter_mut() {
            let record = entry.value_mut();
            let expired = matches!(record.status, KeyStatus::RateLimited | KeyStatus::Disabled)
                && record.disabled_until.is_some_and(|until| until <= now);
            if expired {
                record.status = KeyStatus::Active;
                record.disable_reason = None;
                record.disabled_until = None;
                reactivated += 1;
            }
        }
        if reactivated > 0 {
            debug!(count = reactivated, "Reactivated keys after exclusion window");
        }
        reactivated
    }

    pub fn stats(&self) -> PoolStats {
        let now = self.clock.now();
        let mut stats = PoolStats::default();
        for entry in self.records.iter() {
            let record = entry.value();
            stats.total += 1;
            match record.status {
                KeyStatus::Active => stats.active += 1,
                KeyStatus::RateLimited => stats.rate_limited += 1,
                KeyStatus::Disabled => stats.disabled += 1,
                KeyStatus::Unknown => stats.unknown += 1,
            }
            if record.is_eligible(now) {
                stats.eligible += 1;
            }
            if record.is_free {
                stats.free_tier += 1;
            }
            stats.total_balance += record.balance;
            stats.successes += record.success_count;
            stats.failures += record.failure_count;
            stats.tokens += record.total_tokens;
        }
        stats.requests = stats.successes + stats.failures;
        stats
    }
}

fn not_found(id: &str) -> AppError {
    AppError::KeyNotFound {
        key_preview: preview_key(id),
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}

/// `now + wait`, saturating at the latest representable instant.
fn deadline(now: DateTime<Utc>, wait: chrono::Duration) -> DateTime<Utc> {
    now.checked_add_signed(wait).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `base * 2^disable_count`, capped at `max_backoff`.
fn backoff_for(settings: &StoreSettings, disable_count: u32) -> chrono::Duration {
    let base = settings.base_backoff.as_millis() as u64;
    let factor = 1u64 << disable_count.min(20);
    let capped = base.saturating_mul(factor).min(settings.max_backoff.as_millis() as u64);
    chrono::Duration::milliseconds(capped as i64)
}
