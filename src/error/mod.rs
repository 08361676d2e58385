//! Error handling for the key pool proxy
//!
//! This module provides:
//! - RFC 7807 Problem Details responses
//! - The dispatch error taxonomy (pool exhaustion, local throttling, upstream failures)
//! - Structured logging of errors with request correlation

pub mod types;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum::body::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

/// Standard error response format following RFC 7807 Problem Details
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// A URI reference that identifies the problem type
    #[serde(rename = "type")]
    pub error_type: String,

    /// A short, human-readable summary of the problem type
    pub title: String,

    /// The HTTP status code
    pub status: u16,

    /// A human-readable explanation specific to this occurrence
    pub detail: String,

    /// A URI reference that identifies the specific occurrence
    pub instance: String,

    /// Request ID for tracing
    pub request_id: Option<String>,

    /// Additional error-specific properties
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    // Configuration errors
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // Storage errors
    #[error("Redis operation failed: {operation} - {message}")]
    RedisOperation { operation: String, message: String },

    #[error("Storage persistence failed: {message}")]
    StoragePersistence { message: String },

    // Dispatch taxonomy
    #[error("No eligible API key available")]
    PoolExhausted,

    #[error("All reachable keys are locally throttled after {attempts} selection attempts")]
    RateLimited { attempts: u32 },

    #[error("Upstream request failed with status {status}")]
    UpstreamError { status: u16, body: Bytes, content_type: Option<String> },

    #[error("Upstream rejected the request with status {status}")]
    BadRequest { status: u16, body: Bytes, content_type: Option<String> },

    #[error("Upstream transport failure: {message}")]
    UpstreamTransport { message: String },

    #[error("Request cancelled before completion")]
    RequestCancelled,

    #[error("Request timeout after {timeout_secs}s")]
    RequestTimeout { timeout_secs: u64 },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    // Key management
    #[error("Key not found: {key_preview}")]
    KeyNotFound { key_preview: String },

    #[error("Balance refresh failed for {failed} of {total} keys")]
    RefreshFailed { failed: usize, total: usize },

    #[error("Admin authentication required")]
    Unauthorized,

    // Validation errors
    #[error("Validation failed: {field} - {message}")]
    Validation { field: String, message: String },

    // System errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("IO operation failed: {operation} - {message}")]
    Io { operation: String, message: String },
}

impl AppError {
    /// Create a new configuration validation error
    pub fn config_validation(message: impl Into<String>, field: Option<impl Into<String>>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
            field: field.map(Into::into),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::StoragePersistence {
            message: message.into(),
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // Upstream-provided statuses are passed through
            Self::UpstreamError { status, .. } | Self::BadRequest { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }

            Self::ConfigParse { .. }
            | Self::InvalidRequest { .. }
            | Self::Validation { .. }
            | Self::Serialization { .. } => StatusCode::BAD_REQUEST,

            Self::ConfigNotFound { .. } | Self::KeyNotFound { .. } => StatusCode::NOT_FOUND,

            Self::RequestTimeout { .. } => StatusCode::REQUEST_TIMEOUT,

            Self::Unauthorized => StatusCode::UNAUTHORIZED,

            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            // Non-standard "client closed request"; only visible in logs
            Self::RequestCancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }

            Self::ConfigValidation { .. } | Self::Internal { .. } | Self::Io { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }

            Self::UpstreamTransport { .. } | Self::RefreshFailed { .. } => StatusCode::BAD_GATEWAY,

            Self::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,

            Self::RedisOperation { .. } | Self::StoragePersistence { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
        }
    }

    /// Get the error type URI for RFC 7807 compliance
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::ConfigValidation { .. } | Self::ConfigNotFound { .. } | Self::ConfigParse { .. } => {
                "https://keypool-proxy.dev/errors/configuration"
            }
            Self::RedisOperation { .. } | Self::StoragePersistence { .. } => {
                "https://keypool-proxy.dev/errors/storage"
            }
            Self::UpstreamError { .. }
            | Self::UpstreamTransport { .. }
            | Self::RequestTimeout { .. }
            | Self::RequestCancelled => "https://keypool-proxy.dev/errors/upstream",
            Self::RateLimited { .. } => "https://keypool-proxy.dev/errors/rate-limit",
            Self::PoolExhausted | Self::KeyNotFound { .. } | Self::RefreshFailed { .. } => {
                "https://keypool-proxy.dev/errors/key-pool"
            }
            Self::Validation { .. } | Self::InvalidRequest { .. } | Self::BadRequest { .. } => {
                "https://keypool-proxy.dev/errors/validation"
            }
            Self::Unauthorized => "https://keypool-proxy.dev/errors/authentication",
            _ => "https://keypool-proxy.dev/errors/internal",
        }
    }

    /// Get a human-readable title for the error
    pub fn title(&self) -> &'static str {
        match self {
            Self::ConfigValidation { .. } | Self::ConfigNotFound { .. } | Self::ConfigParse { .. } => {
                "Configuration Error"
            }
            Self::RedisOperation { .. } | Self::StoragePersistence { .. } => "Storage Error",
            Self::UpstreamError { .. }
            | Self::UpstreamTransport { .. }
            | Self::RequestTimeout { .. }
            | Self::RequestCancelled => "Upstream Error",
            Self::RateLimited { .. } => "Rate Limit Exceeded",
            Self::PoolExhausted => "Key Pool Exhausted",
            Self::KeyNotFound { .. } | Self::RefreshFailed { .. } => "Key Management Error",
            Self::Validation { .. } | Self::InvalidRequest { .. } | Self::BadRequest { .. } => {
                "Validation Error"
            }
            Self::Unauthorized => "Unauthorized",
            _ => "Internal Server Error",
        }
    }

    /// Log the error with appropriate level
    pub fn log(&self, request_id: Option<&str>) {
        let request_id = request_id.unwrap_or("unknown");

        if self.status_code().is_server_error() {
            error!(
                error = %self,
                request_id = request_id,
                error_type = self.error_type(),
                "Application error occurred"
            );
        } else {
            warn!(
                error = %self,
                request_id = request_id,
                error_type = self.error_type(),
                "Client error occurred"
            );
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();

        self.log(Some(&request_id));

        let status = self.status_code();

        // Provider bodies go back verbatim so the caller sees the upstream message
        match self {
            Self::UpstreamError { body, content_type, .. } | Self::BadRequest { body, content_type, .. }
                if !body.is_empty() =>
            {
                let mut response = (status, body).into_response();
                if let Some(value) = content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
                    response.headers_mut().insert(header::CONTENT_TYPE, value);
                }
                response
            }
            other => {
                let mut extensions = serde_json::Map::new();
                if let Self::RateLimited { attempts } = &other {
                    extensions.insert("attempts".to_string(), (*attempts).into());
                }
                let error_response = ErrorResponse {
                    error_type: other.error_type().to_string(),
                    title: other.title().to_string(),
                    status: status.as_u16(),
                    detail: other.to_string(),
                    instance: format!("/errors/{}", request_id),
                    request_id: Some(request_id),
                    extensions,
                };

                (status, Json(error_response)).into_response()
            }
        }
    }
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhausted_is_service_unavailable() {
        assert_eq!(AppError::PoolExhausted.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            AppError::RateLimited { attempts: 3 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn upstream_status_passes_through() {
        let err = AppError::BadRequest {
            status: 422,
            body: Bytes::from_static(b"{}"),
            content_type: None,
        };
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
