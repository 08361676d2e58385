// src/dispatcher.rs

use crate::error::{AppError, Result};
use crate::handlers::{Action, ResponseProcessor};
use crate::metrics;
use crate::pool::{
    preview_key, KeyFilter, KeyStore, RateLimiter, Reservation, ReserveOutcome, Selector, Strategy,
    StrategyConfig,
};
use crate::upstream::{ForwardRequest, TransportError, UpstreamClient, UpstreamResponse};
use axum::body::Bytes;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Retry budgets for one dispatched request.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Selections tried when the chosen key is locally throttled.
    pub max_reselect_attempts: u32,
    /// Upstream attempts that may end in a key fault before giving up.
    pub max_key_fault_attempts: u32,
    /// Retries after a transient failure (total attempts = 1 + this).
    pub max_transient_retries: u32,
    /// Base delay between transient retries; grows linearly per retry.
    pub transient_backoff: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_reselect_attempts: 3,
            max_key_fault_attempts: 3,
            max_transient_retries: 2,
            transient_backoff: Duration::from_millis(200),
        }
    }
}

/// Counts dispatches in progress so shutdown can drain them.
#[derive(Debug, Default)]
pub struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        metrics::set_in_flight(self.count());
        InFlightGuard(Arc::clone(self))
    }

    /// Waits until no dispatch is running or `timeout` passes. Returns whether it drained.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            if self.count() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.count() == 0;
            }
        }
    }
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let previous = self.0.count.fetch_sub(1, Ordering::AcqRel);
        metrics::set_in_flight(previous.saturating_sub(1));
        if previous == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

enum Failure {
    Response(UpstreamResponse),
    Transport(TransportError),
}

impl Failure {
    fn into_error(self) -> AppError {
        match self {
            Failure::Response(resp) => AppError::UpstreamError {
                status: resp.status.as_u16(),
                content_type: resp.content_type(),
                body: resp.body,
            },
            Failure::Transport(TransportError::Timeout) => AppError::UpstreamError {
                status: 504,
                body: Bytes::new(),
                content_type: None,
            },
            Failure::Transport(err) => AppError::UpstreamTransport {
                message: err.to_string(),
            },
        }
    }
}

enum AcquireError {
    Exhausted,
    Throttled { attempts: u32 },
}

/// Runs one inbound request end to end: select, reserve, forward, classify, retry.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<KeyStore>,
    limiter: RateLimiter,
    selector: Selector,
    strategies: Arc<StrategyConfig>,
    upstream: Arc<dyn UpstreamClient>,
    processor: ResponseProcessor,
    settings: DispatchSettings,
    in_flight: Arc<InFlight>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<KeyStore>,
        limiter: RateLimiter,
        selector: Selector,
        strategies: Arc<StrategyConfig>,
        upstream: Arc<dyn UpstreamClient>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            limiter,
            selector,
            strategies,
            upstream,
            processor: ResponseProcessor::default(),
            settings,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn strategies(&self) -> &StrategyConfig {
        &self.strategies
    }

    /// Same dispatcher with a different model table; the in-flight counter is shared.
    pub fn with_strategies(&self, strategies: Arc<StrategyConfig>) -> Self {
        Self {
            strategies,
            ..self.clone()
        }
    }

    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.in_flight
    }

    pub async fn dispatch(&self, request: &ForwardRequest) -> Result<UpstreamResponse> {
        self.dispatch_with_cancel(request, &CancellationToken::new()).await
    }

    /// Like [`Dispatcher::dispatch`], aborting the in-flight upstream call when
    /// `cancel` fires. Cancellation is not charged to the key and releases the
    /// rate limiter reservation.
    #[instrument(skip_all, fields(model = request.model.as_deref().unwrap_or("-"), path = %request.path_and_query))]
    pub async fn dispatch_with_cancel(
        &self,
        request: &ForwardRequest,
        cancel: &CancellationToken,
    ) -> Result<UpstreamResponse> {
        let _guard = self.in_flight.enter();
        let strategy = self.strategies.resolve(request.model.as_deref());
        let estimated_tokens = request.estimate_tokens();

        let mut excluded: HashSet<String> = HashSet::new();
        let mut key_fault_attempts = 0u32;
        let mut transient_retries = 0u32;
        let mut last_failure: Option<Failure> = None;

        loop {
            let reservation = match self.acquire(strategy, estimated_tokens, &excluded) {
                Ok(reservation) => reservation,
                Err(AcquireError::Exhausted) => {
                    let err = match last_failure {
                        Some(failure) => failure.into_error(),
                        None => AppError::PoolExhausted,
                    };
                    metrics::record_dispatch(dispatch_label(&err));
                    return Err(err);
                }
                Err(AcquireError::Throttled { attempts }) => {
                    metrics::record_dispatch("rate_limited");
                    return Err(AppError::RateLimited { attempts });
                }
            };
            let key_id = reservation.key_id().to_string();
            let key_preview = preview_key(&key_id);
            debug!(key.preview = %key_preview, strategy = %strategy, "Attempting request with key");

            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(key.preview = %key_preview, "Request cancelled, releasing reservation");
                    metrics::record_dispatch("cancelled");
                    return Err(AppError::RequestCancelled);
                }
                result = self.upstream.forward_request(&key_id, request) => result,
            };
            let latency = started.elapsed();

            let action = match &outcome {
                Ok(response) => self.processor.classify(response),
                Err(_) => Action::Transient,
            };

            match (action, outcome) {
                (Action::Success, Ok(response)) => {
                    let tokens = response.total_tokens().unwrap_or_else(|| reservation.estimated_tokens());
                    self.record(&key_id, true, tokens, latency);
                    reservation.commit(tokens);
                    metrics::record_dispatch("success");
                    return Ok(response);
                }
                (Action::RequestFault, Ok(response)) => {
                    // The key did its job; only the request window stays charged
                    reservation.commit(0);
                    debug!(key.preview = %key_preview, status = response.status.as_u16(), "Request rejected by upstream, not retrying");
                    metrics::record_dispatch("bad_request");
                    return Err(AppError::BadRequest {
                        status: response.status.as_u16(),
                        content_type: response.content_type(),
                        body: response.body,
                    });
                }
                (Action::KeyFault(fault), Ok(response)) => {
                    self.settle_failure(&key_id, reservation, latency);
                    if let Err(e) = self.store.mark_key_fault(&key_id, fault) {
                        debug!(error = %e, "Key vanished before fault could be applied");
                    }
                    excluded.insert(key_id);
                    key_fault_attempts += 1;
                    warn!(
                        key.preview = %key_preview,
                        status = response.status.as_u16(),
                        attempt = key_fault_attempts,
                        budget = self.settings.max_key_fault_attempts,
                        "Key fault from upstream, switching key"
                    );
                    if key_fault_attempts >= self.settings.max_key_fault_attempts {
                        metrics::record_dispatch("upstream_error");
                        return Err(Failure::Response(response).into_error());
                    }
                    last_failure = Some(Failure::Response(response));
                }
                (_, outcome) => {
                    self.settle_failure(&key_id, reservation, latency);
                    let failure = match outcome {
                        Ok(response) => Failure::Response(response),
                        Err(err) => Failure::Transport(err),
                    };
                    if transient_retries >= self.settings.max_transient_retries {
                        warn!(key.preview = %key_preview, retries = transient_retries, "Transient failures exhausted retry budget");
                        let err = failure.into_error();
                        metrics::record_dispatch(dispatch_label(&err));
                        return Err(err);
                    }
                    transient_retries += 1;
                    let delay = self.settings.transient_backoff * transient_retries;
                    warn!(key.preview = %key_preview, retry = transient_retries, delay_ms = delay.as_millis() as u64, "Transient upstream failure, backing off");
                    last_failure = Some(failure);

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            metrics::record_dispatch("cancelled");
                            return Err(AppError::RequestCancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Selects a key and reserves capacity on it, re-selecting past locally throttled keys.
    fn acquire(
        &self,
        strategy: Strategy,
        estimated_tokens: u64,
        excluded: &HashSet<String>,
    ) -> std::result::Result<Reservation, AcquireError> {
        let snapshot = self.store.list(KeyFilter::All);
        let now = self.store.now();
        let mut skip = excluded.clone();
        let mut throttled = 0u32;
        let mut rng = rand::thread_rng();

        for _ in 0..self.settings.max_reselect_attempts.max(1) {
            let Ok(key) = self.selector.select(&snapshot, strategy, now, &skip, &mut rng) else {
                return Err(if throttled > 0 {
                    AcquireError::Throttled { attempts: throttled }
                } else {
                    AcquireError::Exhausted
                });
            };
            metrics::record_selection(strategy);

            match self.limiter.try_reserve(&key.id, estimated_tokens) {
                Ok(ReserveOutcome::Allowed(reservation)) => return Ok(reservation),
                Ok(outcome) => {
                    debug!(key.preview = %preview_key(&key.id), ?outcome, "Key locally throttled, re-selecting");
                    throttled += 1;
                }
                // Removed between snapshot and reservation
                Err(_) => {}
            }
            skip.insert(key.id.clone());
        }

        if throttled > 0 {
            Err(AcquireError::Throttled { attempts: throttled })
        } else {
            Err(AcquireError::Exhausted)
        }
    }

    fn settle_failure(&self, key_id: &str, reservation: Reservation, latency: Duration) {
        self.record(key_id, false, 0, latency);
        reservation.commit(0);
    }

    fn record(&self, key_id: &str, success: bool, tokens: u64, latency: Duration) {
        metrics::record_key_outcome(success);
        if let Err(e) = self.store.record_outcome(key_id, success, tokens, latency) {
            debug!(error = %e, "Outcome for removed key dropped");
        }
    }
}

fn dispatch_label(err: &AppError) -> &'static str {
    match err {
        AppError::PoolExhausted => "pool_exhausted",
        AppError::RateLimited { .. } => "rate_limited",
        AppError::BadRequest { .. } => "bad_request",
        AppError::RequestCancelled => "cancelled",
        _ => "upstream_error",
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("settings", &self.settings)
            .field("in_flight", &self.in_flight.count())
            .finish()
    }
}
