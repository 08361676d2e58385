// src/handlers/timeout.rs

use super::base::{Action, ResponseHandler};
use crate::upstream::UpstreamResponse;
use axum::http::StatusCode;
use tracing::warn;

pub struct TimeoutHandler;

impl ResponseHandler for TimeoutHandler {
    fn handle(&self, response: &UpstreamResponse) -> Option<Action> {
        if matches!(response.status, StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT) {
            warn!(status = response.status.as_u16(), "Upstream timed out");
            Some(Action::Transient)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::base::test_response;

    #[test]
    fn gateway_timeout_is_transient() {
        assert_eq!(TimeoutHandler.handle(&test_response(504, "")), Some(Action::Transient));
        assert_eq!(TimeoutHandler.handle(&test_response(408, "")), Some(Action::Transient));
        assert!(TimeoutHandler.handle(&test_response(500, "")).is_none());
    }
}
