//! Prometheus metrics for the key pool and dispatcher
//!
//! Uses the `metrics` facade; the Prometheus recorder is installed once per
//! process and rendered by the `/metrics` endpoint.

use crate::pool::{PoolStats, Strategy};
use crate::state::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::{Arc, OnceLock};
use tracing::warn;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global Prometheus recorder, or returns the one already installed.
pub fn init() -> Option<PrometheusHandle> {
    if let Some(handle) = HANDLE.get() {
        return Some(handle.clone());
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(HANDLE.get_or_init(|| handle).clone()),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder not installed; metrics disabled");
            None
        }
    }
}

/// Final outcome of one dispatched request.
pub fn record_dispatch(result: &'static str) {
    counter!("keypool_dispatch_total", "result" => result).increment(1);
}

pub fn record_key_outcome(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!("keypool_key_outcomes_total", "outcome" => outcome).increment(1);
}

pub fn record_selection(strategy: Strategy) {
    counter!("keypool_selections_total", "strategy" => strategy.name()).increment(1);
}

pub fn record_refresh(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!("keypool_refresh_total", "outcome" => outcome).increment(1);
}

pub fn set_in_flight(count: usize) {
    gauge!("keypool_dispatch_in_flight").set(count as f64);
}

/// Mirrors the pool composition into gauges.
pub fn record_pool_stats(stats: &PoolStats) {
    gauge!("keypool_keys", "status" => "active").set(stats.active as f64);
    gauge!("keypool_keys", "status" => "rate_limited").set(stats.rate_limited as f64);
    gauge!("keypool_keys", "status" => "disabled").set(stats.disabled as f64);
    gauge!("keypool_keys", "status" => "unknown").set(stats.unknown as f64);
    gauge!("keypool_keys_eligible").set(stats.eligible as f64);
    gauge!("keypool_balance_total").set(stats.total_balance);
}

/// `GET /metrics`
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    record_pool_stats(&state.key_manager.stats());
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed".to_string()),
    }
}
