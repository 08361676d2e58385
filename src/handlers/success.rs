// src/handlers/success.rs

use super::base::{Action, ResponseHandler};
use crate::upstream::UpstreamResponse;

pub struct SuccessHandler;

impl ResponseHandler for SuccessHandler {
    fn handle(&self, response: &UpstreamResponse) -> Option<Action> {
        // Redirects are handed back untouched as well
        if response.status.is_success() || response.status.is_redirection() {
            Some(Action::Success)
        } else {
            None
        }
    }
}
