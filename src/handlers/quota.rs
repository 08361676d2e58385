// src/handlers/quota.rs

use super::base::{body_text, Action, ResponseHandler};
use crate::pool::KeyFault;
use crate::upstream::UpstreamResponse;
use axum::http::StatusCode;

const QUOTA_MARKERS: &[&str] = &[
    "insufficient balance",
    "insufficient_balance",
    "insufficient_quota",
    "balance is insufficient",
    "account balance",
    "exceeded your current quota",
];

/// Balance or quota exhausted on the provider account behind the key.
pub struct QuotaHandler;

impl ResponseHandler for QuotaHandler {
    fn handle(&self, response: &UpstreamResponse) -> Option<Action> {
        if response.status == StatusCode::PAYMENT_REQUIRED {
            return Some(Action::KeyFault(KeyFault::QuotaExhausted));
        }
        if matches!(
            response.status,
            StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS
        ) {
            let body = body_text(response);
            if QUOTA_MARKERS.iter().any(|marker| body.contains(marker)) {
                return Some(Action::KeyFault(KeyFault::QuotaExhausted));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::base::test_response;
    use rstest::rstest;

    #[rstest]
    #[case(402, "")]
    #[case(429, r#"{"error":{"code":"insufficient_quota"}}"#)]
    #[case(403, r#"{"message":"Sorry, your account balance is insufficient"}"#)]
    fn quota_exhaustion_is_detected(#[case] status: u16, #[case] body: &str) {
        assert_eq!(
            QuotaHandler.handle(&test_response(status, body)),
            Some(Action::KeyFault(KeyFault::QuotaExhausted))
        );
    }

    #[test]
    fn ordinary_rate_limit_is_not_quota() {
        assert!(QuotaHandler.handle(&test_response(429, "slow down")).is_none());
    }
}
