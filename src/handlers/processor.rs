// src/handlers/processor.rs

use crate::handlers::{
    base::{Action, ResponseHandler},
    invalid_api_key::InvalidApiKeyHandler,
    quota::QuotaHandler,
    rate_limit::RateLimitHandler,
    server_error::ServerErrorHandler,
    success::SuccessHandler,
    terminal_error::TerminalErrorHandler,
    timeout::TimeoutHandler,
};
use crate::upstream::UpstreamResponse;
use std::sync::Arc;

/// Classifies a response through a chain of handlers.
#[derive(Clone)]
pub struct ResponseProcessor {
    handlers: Arc<Vec<Box<dyn ResponseHandler>>>,
}

impl ResponseProcessor {
    /// Creates a new `ResponseProcessor` with a given chain of handlers.
    pub fn new(handlers: Vec<Box<dyn ResponseHandler>>) -> Self {
        Self {
            handlers: Arc::new(handlers),
        }
    }

    /// First handler that recognises the response wins. Unrecognised
    /// statuses (1xx) are passed back as-is.
    pub fn classify(&self, response: &UpstreamResponse) -> Action {
        self.handlers
            .iter()
            .find_map(|handler| handler.handle(response))
            .unwrap_or(Action::Success)
    }
}

impl Default for ResponseProcessor {
    fn default() -> Self {
        // Order matters: quota before rate limit (a 429 may mean an empty
        // account), and the terminal handler last.
        Self::new(vec![
            Box::new(SuccessHandler),
            Box::new(InvalidApiKeyHandler),
            Box::new(QuotaHandler),
            Box::new(RateLimitHandler),
            Box::new(TimeoutHandler),
            Box::new(ServerErrorHandler),
            Box::new(TerminalErrorHandler),
        ])
    }
}

impl std::fmt::Debug for ResponseProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseProcessor")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::base::test_response;
    use crate::pool::KeyFault;
    use rstest::rstest;

    #[rstest]
    #[case(200, "{}", Action::Success)]
    #[case(401, "", Action::KeyFault(KeyFault::Unauthorized))]
    #[case(402, "", Action::KeyFault(KeyFault::QuotaExhausted))]
    #[case(429, "", Action::KeyFault(KeyFault::RateLimited { retry_after: None }))]
    #[case(408, "", Action::Transient)]
    #[case(503, "", Action::Transient)]
    #[case(400, r#"{"message":"bad input"}"#, Action::RequestFault)]
    #[case(404, "", Action::RequestFault)]
    fn default_chain_classification(#[case] status: u16, #[case] body: &str, #[case] expected: Action) {
        assert_eq!(ResponseProcessor::default().classify(&test_response(status, body)), expected);
    }
}
