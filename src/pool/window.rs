// src/pool/window.rs

use chrono::{DateTime, Utc};

/// Width of a single bucket, in seconds.
pub const BUCKET_SECS: i64 = 10;
/// Buckets per window; 6 × 10s covers the trailing minute.
pub const BUCKET_COUNT: usize = 6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Bucket {
    epoch: i64,
    value: u64,
}

/// Sliding counter over the trailing 60 seconds, split into fixed 10s buckets.
///
/// Each bucket remembers which 10s epoch it belongs to, so stale buckets are
/// ignored on read and overwritten on the next write into the same slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlidingWindow {
    buckets: [Bucket; BUCKET_COUNT],
}

/// Identifies the bucket a value was added to, so it can be corrected later.
pub fn epoch_of(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(BUCKET_SECS)
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(epoch: i64) -> usize {
        epoch.rem_euclid(BUCKET_COUNT as i64) as usize
    }

    fn is_live(bucket: &Bucket, now_epoch: i64) -> bool {
        bucket.value > 0 && now_epoch - bucket.epoch < BUCKET_COUNT as i64 && bucket.epoch <= now_epoch
    }

    /// Adds `amount` to the bucket for `now` and returns that bucket's epoch.
    pub fn add(&mut self, now: DateTime<Utc>, amount: u64) -> i64 {
        let epoch = epoch_of(now);
        let bucket = &mut self.buckets[Self::slot(epoch)];
        if bucket.epoch != epoch {
            *bucket = Bucket { epoch, value: 0 };
        }
        bucket.value = bucket.value.saturating_add(amount);
        epoch
    }

    /// Removes `amount` from the bucket recorded at `epoch`, if that bucket has not rolled over.
    pub fn subtract(&mut self, epoch: i64, amount: u64) {
        let bucket = &mut self.buckets[Self::slot(epoch)];
        if bucket.epoch == epoch {
            bucket.value = bucket.value.saturating_sub(amount);
        }
    }

    /// Sum over the non-expired buckets.
    pub fn total(&self, now: DateTime<Utc>) -> u64 {
        let now_epoch = epoch_of(now);
        self.buckets
            .iter()
            .filter(|b| Self::is_live(b, now_epoch))
            .map(|b| b.value)
            .sum()
    }

    /// Clears expired buckets.
    pub fn roll(&mut self, now: DateTime<Utc>) {
        let now_epoch = epoch_of(now);
        for bucket in &mut self.buckets {
            if !Self::is_live(bucket, now_epoch) {
                *bucket = Bucket::default();
            }
        }
    }

    pub fn reset(&mut self) {
        self.buckets = [Bucket::default(); BUCKET_COUNT];
    }
}
