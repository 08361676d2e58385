// src/handlers/rate_limit.rs

use super::base::{body_text, Action, ResponseHandler};
use crate::pool::KeyFault;
use crate::upstream::UpstreamResponse;
use axum::http::{header, HeaderMap, StatusCode};
use std::time::Duration;

const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "rate_limit", "too many requests"];

/// Longest provider-requested wait taken at face value.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

pub struct RateLimitHandler;

impl ResponseHandler for RateLimitHandler {
    fn handle(&self, response: &UpstreamResponse) -> Option<Action> {
        let limited = response.status == StatusCode::TOO_MANY_REQUESTS
            || (response.status == StatusCode::BAD_REQUEST
                && RATE_LIMIT_MARKERS.iter().any(|m| body_text(response).contains(m)));
        limited.then(|| {
            Action::KeyFault(KeyFault::RateLimited {
                retry_after: retry_after(&response.headers),
            })
        })
    }
}

/// `Retry-After` as delay-seconds, or a simple `1m30s` / `500ms` duration,
/// capped at [`MAX_RETRY_AFTER`].
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(header::RETRY_AFTER)?.to_str().ok()?.trim();
    let delay = if let Ok(secs) = value.parse::<u64>() {
        Duration::from_secs(secs)
    } else if let Ok(secs) = value.parse::<f64>() {
        if secs.is_nan() || secs < 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(MAX_RETRY_AFTER)
    } else {
        parse_duration_string(value)?
    };
    Some(delay.min(MAX_RETRY_AFTER))
}

/// Overflowing components saturate; the caller caps the result.
fn parse_duration_string(s: &str) -> Option<Duration> {
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse::<u64>().ok().map(Duration::from_millis);
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n = match digits.parse::<u64>() {
            Ok(n) => n,
            Err(e) if *e.kind() == std::num::IntErrorKind::PosOverflow => u64::MAX,
            Err(_) => return None,
        };
        digits.clear();
        let unit = match c {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return None,
        };
        total = total.saturating_add(n.saturating_mul(unit));
    }
    digits.is_empty().then_some(Duration::from_secs(total))
}
