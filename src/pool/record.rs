// src/pool/record.rs

use crate::pool::window::SlidingWindow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    RateLimited,
    Disabled,
    Unknown,
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KeyStatus::Active => "active",
            KeyStatus::RateLimited => "rate_limited",
            KeyStatus::Disabled => "disabled",
            KeyStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Why a key left the `Active` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableReason {
    ConsecutiveFailures,
    InvalidCredential,
    BalanceExhausted,
    ProviderRateLimit,
    Unhealthy,
}

/// Weights for the composite score. All values come from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    /// Weight of the (blended) success component.
    pub success_weight: f64,
    /// Weight of the responsiveness component.
    pub latency_weight: f64,
    /// How much the recent EWMA counts against the lifetime rate, in [0, 1].
    pub recency_weight: f64,
    /// Smoothing factor for both EWMAs, in (0, 1].
    pub ewma_alpha: f64,
    /// Latency at which responsiveness is 0.5.
    pub latency_reference_ms: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            success_weight: 0.7,
            latency_weight: 0.3,
            recency_weight: 0.5,
            ewma_alpha: 0.2,
            latency_reference_ms: 2000.0,
        }
    }
}

/// Runtime state of one API key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// The credential itself.
    pub id: String,
    pub status: KeyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_reason: Option<DisableReason>,
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub is_free: bool,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Number of times the failure policy has disabled this key; drives backoff growth.
    #[serde(default)]
    pub disable_count: u32,
    #[serde(default = "default_recent_success")]
    pub recent_success: f64,
    #[serde(default)]
    pub avg_latency_ms: f64,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_refreshed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub disabled_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpm_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm_limit: Option<u64>,
    #[serde(skip)]
    pub rpm_window: SlidingWindow,
    #[serde(skip)]
    pub tpm_window: SlidingWindow,
    #[serde(skip)]
    pub(crate) added_seq: u64,
    #[serde(skip)]
    score: f64,
}

fn default_recent_success() -> f64 {
    1.0
}

impl KeyRecord {
    /// A fresh record. New keys start `Unknown` until their first refresh.
    pub fn new(id: impl Into<String>) -> Self {
        let mut record = Self {
            id: id.into(),
            status: KeyStatus::Unknown,
            disable_reason: None,
            balance: 0.0,
            is_free: false,
            success_count: 0,
            failure_count: 0,
            total_tokens: 0,
            consecutive_failures: 0,
            disable_count: 0,
            recent_success: 1.0,
            avg_latency_ms: 0.0,
            last_used_at: None,
            last_refreshed_at: None,
            disabled_until: None,
            rpm_limit: None,
            tpm_limit: None,
            rpm_window: SlidingWindow::new(),
            tpm_window: SlidingWindow::new(),
            added_seq: 0,
            score: 0.0,
        };
        record.recompute_score(&ScoreWeights::default());
        record
    }

    pub fn with_status(mut self, status: KeyStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_balance(mut self, balance: f64) -> Self {
        self.balance = balance;
        self
    }

    /// `success / (success + failure)`, or 1.0 for an untouched key.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    /// Cached composite score; only [`KeyRecord::recompute_score`] writes it.
    pub fn score(&self) -> f64 {
        self.score
    }

    /// Pure function of the record's other fields.
    pub fn compute_score(&self, weights: &ScoreWeights) -> f64 {
        let recency = weights.recency_weight.clamp(0.0, 1.0);
        let blended = recency * self.recent_success + (1.0 - recency) * self.success_rate();

        let reference = weights.latency_reference_ms.max(1.0);
        let responsiveness = reference / (reference + self.avg_latency_ms.max(0.0));

        let total_weight = weights.success_weight + weights.latency_weight;
        if total_weight <= 0.0 {
            return blended;
        }
        (weights.success_weight * blended + weights.latency_weight * responsiveness) / total_weight
    }

    pub fn recompute_score(&mut self, weights: &ScoreWeights) {
        self.score = self.compute_score(weights);
    }

    /// Whether the temporary exclusion window is still running.
    pub fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.disabled_until.is_some_and(|until| until > now)
    }

    /// Selector eligibility: `Active` without a live exclusion window, or a
    /// temporarily excluded key whose window has elapsed.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            KeyStatus::Active => !self.is_cooling_down(now),
            KeyStatus::RateLimited | KeyStatus::Disabled => {
                matches!(self.disabled_until, Some(until) if until <= now)
            }
            KeyStatus::Unknown => false,
        }
    }

    /// Fallback eligibility for keys whose health has not been established.
    pub fn is_fallback_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == KeyStatus::Unknown && !self.is_cooling_down(now)
    }

    pub fn current_rpm(&self, now: DateTime<Utc>) -> u64 {
        self.rpm_window.total(now)
    }

    pub fn current_tpm(&self, now: DateTime<Utc>) -> u64 {
        self.tpm_window.total(now)
    }
}

/// Masks a credential for logs and admin output: `abcd...wxyz`.
pub fn preview_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn untouched_key_has_neutral_success_rate() {
        let record = KeyRecord::new("sk-test-0000000001");
        assert_eq!(record.success_rate(), 1.0);
    }

    #[test]
    fn score_is_deterministic() {
        let mut record = KeyRecord::new("sk-test-0000000001");
        record.success_count = 7;
        record.failure_count = 3;
        record.avg_latency_ms = 850.0;
        record.recent_success = 0.6;
        let weights = ScoreWeights::default();
        assert_eq!(record.compute_score(&weights), record.compute_score(&weights));
        record.recompute_score(&weights);
        assert_eq!(record.score(), record.compute_score(&weights));
    }

    #[test]
    fn slower_key_scores_lower() {
        let weights = ScoreWeights::default();
        let mut fast = KeyRecord::new("sk-fast-000000001");
        fast.avg_latency_ms = 100.0;
        let mut slow = KeyRecord::new("sk-slow-000000001");
        slow.avg_latency_ms = 5000.0;
        assert!(fast.compute_score(&weights) > slow.compute_score(&weights));
    }

    #[test]
    fn disabled_key_becomes_eligible_after_window() {
        let now = Utc::now();
        let mut record = KeyRecord::new("sk-test-0000000001").with_status(KeyStatus::Disabled);
        record.disabled_until = Some(now + Duration::seconds(60));
        assert!(!record.is_eligible(now));
        assert!(record.is_eligible(now + Duration::seconds(61)));
    }

    #[test]
    fn permanently_disabled_key_is_never_eligible() {
        let record = KeyRecord::new("sk-test-0000000001").with_status(KeyStatus::Disabled);
        assert!(!record.is_eligible(Utc::now() + Duration::days(365)));
    }

    #[test]
    fn preview_masks_middle() {
        assert_eq!(preview_key("sk-abcdefghijklmnop"), "sk-a...mnop");
        assert_eq!(preview_key("short"), "****");
    }
}
