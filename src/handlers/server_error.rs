// src/handlers/server_error.rs

use super::base::{Action, ResponseHandler};
use crate::upstream::UpstreamResponse;
use tracing::warn;

/// Handler for provider-side failures that are worth retrying
pub struct ServerErrorHandler;

impl ResponseHandler for ServerErrorHandler {
    fn handle(&self, response: &UpstreamResponse) -> Option<Action> {
        if response.status.is_server_error() {
            let body_text = String::from_utf8_lossy(&response.body);
            warn!(
                status = response.status.as_u16(),
                response_body = %body_text,
                "Server error detected, will retry"
            );
            return Some(Action::Transient);
        }
        None
    }
}
