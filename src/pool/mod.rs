// src/pool/mod.rs

//! Key pool: per-key state, sliding-window rate limiting and selection.

pub mod rate_limiter;
pub mod record;
pub mod selector;
pub mod store;
pub mod window;

pub use rate_limiter::{RateLimiter, RateLimits, Reservation, ReserveOutcome};
pub use record::{preview_key, DisableReason, KeyRecord, KeyStatus, ScoreWeights};
pub use selector::{NoEligibleKey, Selector, Strategy, StrategyConfig, DEFAULT_MODEL_KEY};
pub use store::{KeyFault, KeyFilter, KeyStore, PoolStats, StoreSettings};
pub use window::SlidingWindow;
