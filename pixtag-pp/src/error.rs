//! Error types for pixtag-pp

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// pixtag-common error; status depends on the variant
    #[error(transparent)]
    Common(#[from] pixtag_common::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use pixtag_common::Error as E;

        let (status, error_code) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Common(E::QueueBusy { .. }) => (StatusCode::CONFLICT, "QUEUE_BUSY"),
            ApiError::Common(E::Selection(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "SELECTION_ERROR")
            }
            ApiError::Common(E::InvalidInput(_)) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Common(E::NotFound(_)) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Common(E::Database(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR")
            }
            ApiError::Common(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
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

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
