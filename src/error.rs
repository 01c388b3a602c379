use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = TarotError> = std::result::Result<T, E>;

/// Errors surfaced synchronously by the queue, limiter and HTTP layers.
#[derive(Debug, Error)]
pub enum TarotError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("No backend instance available")]
    NoBackendAvailable,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for TarotError {
    fn from(err: redis::RedisError) -> Self {
        TarotError::BackendUnavailable(err.to_string())
    }
}

impl From<validator::ValidationErrors> for TarotError {
    fn from(err: validator::ValidationErrors) -> Self {
        TarotError::Validation(err.to_string())
    }
}

/// Outcome of a single call against an AI backend instance.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode backend response: {0}")]
    Decode(String),

    #[error("backend returned an empty interpretation")]
    EmptyResponse,

    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("no backend instance available")]
    NoBackendAvailable,

    #[error("task cancelled")]
    Cancelled,

    #[error("task deadline exceeded")]
    DeadlineExceeded,
}

impl BackendError {
    /// The caller has given up; retrying cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BackendError::Cancelled | BackendError::DeadlineExceeded)
    }

    /// Whether this outcome should count against the instance that produced it.
    pub fn counts_against_instance(&self) -> bool {
        !matches!(
            self,
            BackendError::NoBackendAvailable | BackendError::Cancelled | BackendError::DeadlineExceeded
        )
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BackendError::Decode(err.to_string())
        } else {
            BackendError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_error(err: &TarotError) -> Self {
        let message = err.to_string();
        match err {
            TarotError::Validation(_) => Self::new("validation_error", &message, 422),
            TarotError::RateLimited => {
                Self::new("rate_limit_exceeded", "Too many requests, please retry later", 429)
            }
            TarotError::InvalidFormat(_) => Self::new("bad_request", &message, 400),
            TarotError::Serialization(_) => Self::new("internal_error", &message, 500),
            TarotError::BackendUnavailable(_) => Self::new("service_unavailable", &message, 503),
            TarotError::NoBackendAvailable => Self::new("service_unavailable", &message, 503),
            TarotError::NotFound(_) => Self::new("not_found", &message, 404),
            TarotError::Configuration(_) => Self::new("configuration_error", &message, 500),
            TarotError::Internal(_) => Self::new("internal_error", &message, 500),
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for TarotError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_error(&self);
        if body.code >= 500 {
            tracing::error!(error = %self, "Request failed");
        }
        (body.status(), Json(body)).into_response()
    }
}
