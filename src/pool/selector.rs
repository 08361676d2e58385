// src/pool/selector.rs

use crate::pool::record::KeyRecord;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Key selection policy. Configuration carries these as ids 1-8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Strategy {
    HighSuccessRate,
    HighScore,
    LowRpm,
    LowTpm,
    HighBalance,
    Normal,
    LowBalance,
    Free,
}

impl Strategy {
    pub const ALL: [Strategy; 8] = [
        Strategy::HighSuccessRate,
        Strategy::HighScore,
        Strategy::LowRpm,
        Strategy::LowTpm,
        Strategy::HighBalance,
        Strategy::Normal,
        Strategy::LowBalance,
        Strategy::Free,
    ];

    pub fn id(self) -> u8 {
        match self {
            Strategy::HighSuccessRate => 1,
            Strategy::HighScore => 2,
            Strategy::LowRpm => 3,
            Strategy::LowTpm => 4,
            Strategy::HighBalance => 5,
            Strategy::Normal => 6,
            Strategy::LowBalance => 7,
            Strategy::Free => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Strategy::HighSuccessRate => "high_success_rate",
            Strategy::HighScore => "high_score",
            Strategy::LowRpm => "low_rpm",
            Strategy::LowTpm => "low_tpm",
            Strategy::HighBalance => "high_balance",
            Strategy::Normal => "normal",
            Strategy::LowBalance => "low_balance",
            Strategy::Free => "free",
        }
    }

    /// Human-readable label for the startup strategy table.
    pub fn label(self) -> &'static str {
        match self {
            Strategy::HighSuccessRate => "High success rate",
            Strategy::HighScore => "High score",
            Strategy::LowRpm => "Low RPM",
            Strategy::LowTpm => "Low TPM",
            Strategy::HighBalance => "High balance",
            Strategy::Normal => "Normal",
            Strategy::LowBalance => "Low balance",
            Strategy::Free => "Free",
        }
    }
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Normal
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown strategy '{0}', expected an id 1-8 or a strategy name")]
pub struct UnknownStrategy(pub String);

impl TryFrom<u8> for Strategy {
    type Error = UnknownStrategy;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        Strategy::ALL
            .into_iter()
            .find(|s| s.id() == id)
            .ok_or_else(|| UnknownStrategy(id.to_string()))
    }
}

impl From<Strategy> for u8 {
    fn from(strategy: Strategy) -> Self {
        strategy.id()
    }
}

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(id) = trimmed.parse::<u8>() {
            return Strategy::try_from(id);
        }
        Strategy::ALL
            .into_iter()
            .find(|st| st.name().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownStrategy(trimmed.to_string()))
    }
}

/// Wildcard model entry in [`StrategyConfig::models`].
pub const DEFAULT_MODEL_KEY: &str = "*";

/// Model name → strategy, with a global default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub default: Strategy,
    pub models: BTreeMap<String, Strategy>,
}

impl StrategyConfig {
    /// Exact model match, then the `"*"` entry, then the global default.
    pub fn resolve(&self, model: Option<&str>) -> Strategy {
        model
            .and_then(|m| self.models.get(m))
            .or_else(|| self.models.get(DEFAULT_MODEL_KEY))
            .copied()
            .unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no eligible key")]
pub struct NoEligibleKey;

/// Pure selection over a pool snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Selector {
    /// Low-balance prefers keys strictly above this.
    pub low_balance_floor: f64,
}

impl Default for Selector {
    fn default() -> Self {
        Self { low_balance_floor: 0.0 }
    }
}

impl Selector {
    pub fn new(low_balance_floor: f64) -> Self {
        Self { low_balance_floor }
    }

    /// Picks one key from `pool`, skipping `excluded` ids.
    ///
    /// The strategy runs over eligible keys first; `Unknown` keys are a
    /// fallback tried only when it finds nothing there. Ties go to the least
    /// recently used key.
    pub fn select<'a, R: Rng + ?Sized>(
        &self,
        pool: &'a [KeyRecord],
        strategy: Strategy,
        now: DateTime<Utc>,
        excluded: &HashSet<String>,
        rng: &mut R,
    ) -> Result<&'a KeyRecord, NoEligibleKey> {
        let eligible: Vec<&KeyRecord> = pool
            .iter()
            .filter(|r| r.is_eligible(now) && !excluded.contains(&r.id))
            .collect();
        if let Some(chosen) = self.apply(&eligible, strategy, now, rng) {
            return Ok(chosen);
        }

        let fallback: Vec<&KeyRecord> = pool
            .iter()
            .filter(|r| r.is_fallback_eligible(now) && !excluded.contains(&r.id))
            .collect();
        self.apply(&fallback, strategy, now, rng).ok_or(NoEligibleKey)
    }

    fn apply<'a, R: Rng + ?Sized>(
        &self,
        candidates: &[&'a KeyRecord],
        strategy: Strategy,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Option<&'a KeyRecord> {
        match strategy {
            Strategy::HighSuccessRate => best_by(candidates, |r| r.success_rate()),
            Strategy::HighScore => best_by(candidates, |r| r.score()),
            Strategy::LowRpm => best_by(candidates, |r| -(r.current_rpm(now) as f64)),
            Strategy::LowTpm => best_by(candidates, |r| -(r.current_tpm(now) as f64)),
            Strategy::HighBalance => best_by(candidates, |r| r.balance),
            Strategy::LowBalance => {
                let above_floor: Vec<&KeyRecord> = candidates
                    .iter()
                    .copied()
                    .filter(|r| r.balance > self.low_balance_floor)
                    .collect();
                let pool = if above_floor.is_empty() { candidates } else { &above_floor[..] };
                best_by(pool, |r| -r.balance)
            }
            Strategy::Normal => candidates.choose(rng).copied(),
            Strategy::Free => {
                let free: Vec<&KeyRecord> = candidates.iter().copied().filter(|r| r.is_free).collect();
                free.choose(rng).copied()
            }
        }
    }
}

/// Higher metric wins; equal metrics go to the least recently used, then the oldest entry.
fn best_by<'a>(candidates: &[&'a KeyRecord], metric: impl Fn(&KeyRecord) -> f64) -> Option<&'a KeyRecord> {
    candidates
        .iter()
        .copied()
        .max_by(|a, b| metric(a).total_cmp(&metric(b)).then_with(|| lru_preference(a, b)))
}

fn lru_preference(a: &KeyRecord, b: &KeyRecord) -> Ordering {
    // `None` (never used) sorts first, so reversing puts it on top
    b.last_used_at
        .cmp(&a.last_used_at)
        .then_with(|| b.added_seq.cmp(&a.added_seq))
}
