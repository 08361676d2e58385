// src/handlers/terminal_error.rs

use super::base::{Action, ResponseHandler};
use crate::upstream::UpstreamResponse;

/// Last in the chain: any remaining 4xx is the caller's problem.
pub struct TerminalErrorHandler;

impl ResponseHandler for TerminalErrorHandler {
    fn handle(&self, response: &UpstreamResponse) -> Option<Action> {
        response.status.is_client_error().then_some(Action::RequestFault)
    }
}
