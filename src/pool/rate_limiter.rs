// src/pool/rate_limiter.rs

use crate::error::Result;
use crate::pool::store::KeyStore;
use std::sync::Arc;
use tracing::trace;

/// Default per-key limits; a record's own `rpm_limit`/`tpm_limit` take precedence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimits {
    pub rpm: Option<u64>,
    pub tpm: Option<u64>,
}

/// Result of [`RateLimiter::try_reserve`].
#[derive(Debug)]
pub enum ReserveOutcome {
    Allowed(Reservation),
    RpmExceeded,
    TpmExceeded,
}

impl ReserveOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ReserveOutcome::Allowed(_))
    }
}

/// Non-blocking RPM/TPM admission over the per-key sliding windows.
///
/// A reservation counts the request and its estimated tokens immediately.
/// [`Reservation::commit`] swaps the estimate for the real token count;
/// dropping an uncommitted reservation gives both back.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Arc<KeyStore>,
    limits: RateLimits,
}

impl RateLimiter {
    pub fn new(store: Arc<KeyStore>, limits: RateLimits) -> Self {
        Self { store, limits }
    }

    pub fn limits(&self) -> RateLimits {
        self.limits
    }

    pub fn try_reserve(&self, id: &str, estimated_tokens: u64) -> Result<ReserveOutcome> {
        let defaults = self.limits;
        let decision = self.store.update(id, |record, now| {
            let rpm_limit = record.rpm_limit.or(defaults.rpm);
            let tpm_limit = record.tpm_limit.or(defaults.tpm);

            let rpm = record.rpm_window.total(now);
            if rpm_limit.is_some_and(|limit| rpm + 1 > limit) {
                return Err(ReserveDenied::Rpm);
            }
            let tpm = record.tpm_window.total(now);
            // A single oversized request is still admitted on an idle key
            if tpm_limit.is_some_and(|limit| tpm > 0 && tpm + estimated_tokens > limit) {
                return Err(ReserveDenied::Tpm);
            }

            let rpm_epoch = record.rpm_window.add(now, 1);
            let tpm_epoch = record.tpm_window.add(now, estimated_tokens);
            Ok((rpm_epoch, tpm_epoch))
        })?;

        Ok(match decision {
            Ok((rpm_epoch, tpm_epoch)) => {
                trace!(rpm_epoch, estimated_tokens, "Rate limiter reservation granted");
                ReserveOutcome::Allowed(Reservation {
                    store: Arc::clone(&self.store),
                    id: id.to_string(),
                    rpm_epoch,
                    tpm_epoch,
                    estimated_tokens,
                    settled: false,
                })
            }
            Err(ReserveDenied::Rpm) => ReserveOutcome::RpmExceeded,
            Err(ReserveDenied::Tpm) => ReserveOutcome::TpmExceeded,
        })
    }

    /// Corrects a reservation with the real token count.
    pub fn commit(&self, reservation: Reservation, actual_tokens: u64) {
        reservation.commit(actual_tokens);
    }

    /// Current `(rpm, tpm)` usage for one key.
    pub fn usage(&self, id: &str) -> Result<(u64, u64)> {
        let now = self.store.now();
        let record = self.store.get(id)?;
        Ok((record.current_rpm(now), record.current_tpm(now)))
    }
}

enum ReserveDenied {
    Rpm,
    Tpm,
}

/// Outstanding admission for one request against one key.
#[derive(Debug)]
pub struct Reservation {
    store: Arc<KeyStore>,
    id: String,
    rpm_epoch: i64,
    tpm_epoch: i64,
    estimated_tokens: u64,
    settled: bool,
}

impl Reservation {
    pub fn key_id(&self) -> &str {
        &self.id
    }

    pub fn estimated_tokens(&self) -> u64 {
        self.estimated_tokens
    }

    /// Keeps the request in the RPM window and replaces the token estimate with `actual_tokens`.
    pub fn commit(mut self, actual_tokens: u64) {
        self.settled = true;
        let estimated = self.estimated_tokens;
        let epoch = self.tpm_epoch;
        // The key may have been removed meanwhile; nothing to correct then
        let _ = self.store.update(&self.id, |record, now| {
            record.tpm_window.subtract(epoch, estimated);
            if actual_tokens > 0 {
                record.tpm_window.add(now, actual_tokens);
            }
        });
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let (rpm_epoch, tpm_epoch, estimated) = (self.rpm_epoch, self.tpm_epoch, self.estimated_tokens);
        let _ = self.store.update(&self.id, |record, _| {
            record.rpm_window.subtract(rpm_epoch, 1);
            record.tpm_window.subtract(tpm_epoch, estimated);
        });
        trace!("Released uncommitted rate limiter reservation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::pool::record::{KeyRecord, KeyStatus};
    use crate::pool::store::StoreSettings;

    fn limiter(limits: RateLimits) -> (RateLimiter, Arc<KeyStore>) {
        let store = Arc::new(KeyStore::new(
            StoreSettings::default(),
            Arc::new(ManualClock::default()),
        ));
        store.upsert(KeyRecord::new("sk-a-00000000001").with_status(KeyStatus::Active));
        (RateLimiter::new(Arc::clone(&store), limits), store)
    }

    #[test]
    fn dropped_reservation_is_released() {
        let (limiter, _) = limiter(RateLimits::default());
        let outcome = limiter.try_reserve("sk-a-00000000001", 100).unwrap();
        assert_eq!(limiter.usage("sk-a-00000000001").unwrap(), (1, 100));
        drop(outcome);
        assert_eq!(limiter.usage("sk-a-00000000001").unwrap(), (0, 0));
    }

    #[test]
    fn commit_replaces_estimate() {
        let (limiter, _) = limiter(RateLimits::default());
        let ReserveOutcome::Allowed(reservation) = limiter.try_reserve("sk-a-00000000001", 100).unwrap() else {
            panic!("expected reservation");
        };
        limiter.commit(reservation, 240);
        assert_eq!(limiter.usage("sk-a-00000000001").unwrap(), (1, 240));
    }

    #[test]
    fn tpm_limit_rejects_overflow() {
        let (limiter, _) = limiter(RateLimits { rpm: None, tpm: Some(1000) });
        let _first = limiter.try_reserve("sk-a-00000000001", 800).unwrap();
        assert!(matches!(
            limiter.try_reserve("sk-a-00000000001", 300).unwrap(),
            ReserveOutcome::TpmExceeded
        ));
    }

    #[test]
    fn per_key_override_wins() {
        let (limiter, store) = limiter(RateLimits { rpm: Some(100), tpm: None });
        let mut record = store.get("sk-a-00000000001").unwrap();
        record.rpm_limit = Some(1);
        store.upsert(record);
        let _held = limiter.try_reserve("sk-a-00000000001", 1).unwrap();
        assert!(matches!(
            limiter.try_reserve("sk-a-00000000001", 1).unwrap(),
            ReserveOutcome::RpmExceeded
        ));
    }
}
