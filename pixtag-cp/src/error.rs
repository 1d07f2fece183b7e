//! Error types for pixtag-cp
//!
//! Per-image [`FetchError`]s are absorbed by the worker. [`TaskError`] fails
//! the whole task and is returned to the queue as a non-2xx response, so the
//! queue's retry policy decides what happens next.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pixtag_common::schema::validate::ValidationError;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Failure to download one image
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("HTTP {0}")]
    Status(u16),

    #[error("empty response body")]
    EmptyBody,

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Model invocation failure
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("Model request failed: {0}")]
    RequestFailed(String),

    #[error("Model returned error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Model rate limited, retry after {retry_after_secs:?} seconds")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Failed to parse model response: {0}")]
    Parse(String),

    #[error("Model not configured: {0}")]
    NotConfigured(String),
}

/// Whole-task failure
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("All {attempted} image fetches failed")]
    AllFetchesFailed { attempted: usize },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Model output rejected: {0}")]
    Validation(#[from] ValidationError),

    #[error("Failed to persist results: {0}")]
    Persist(#[source] pixtag_common::Error),

    #[error("Task exceeded its {0:?} deadline")]
    Timeout(Duration),
}

impl TaskError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            TaskError::AllFetchesFailed { .. } => (StatusCode::BAD_GATEWAY, "FETCH_FAILED"),
            TaskError::Model(ModelError::RateLimited { .. }) => {
                (StatusCode::TOO_MANY_REQUESTS, "MODEL_RATE_LIMITED")
            }
            TaskError::Model(_) => (StatusCode::BAD_GATEWAY, "MODEL_ERROR"),
            TaskError::Validation(_) => (StatusCode::BAD_GATEWAY, "VALIDATION_ERROR"),
            TaskError::Persist(_) => (StatusCode::INTERNAL_SERVER_ERROR, "PERSIST_ERROR"),
            TaskError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TASK_TIMEOUT"),
        }
    }
}

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Task(#[from] TaskError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::Task(e) => e.status_and_code(),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
