// src/handlers/invalid_api_key.rs

use super::base::{body_text, Action, ResponseHandler};
use crate::pool::KeyFault;
use crate::upstream::UpstreamResponse;
use axum::http::StatusCode;

const INVALID_KEY_MARKERS: &[&str] = &[
    "invalid api key",
    "invalid_api_key",
    "api key is invalid",
    "api_key_invalid",
    "invalid token",
    "incorrect api key",
];

pub struct InvalidApiKeyHandler;

impl ResponseHandler for InvalidApiKeyHandler {
    fn handle(&self, response: &UpstreamResponse) -> Option<Action> {
        match response.status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Some(Action::KeyFault(KeyFault::Unauthorized))
            }
            StatusCode::BAD_REQUEST => {
                let body = body_text(response);
                INVALID_KEY_MARKERS
                    .iter()
                    .any(|marker| body.contains(marker))
                    .then_some(Action::KeyFault(KeyFault::Unauthorized))
            }
            _ => None,
        }
    }
}
