//! Callback token check for task delivery
//!
//! The queue signs each task body; see `pixtag_common::api::auth`.

use axum::{
    body::Body,
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use pixtag_common::api::auth::{bearer_token, now_ms, verify_callback, ApiAuthError};
use serde_json::Value;
use tracing::warn;

use crate::{ApiError, AppState};

/// Largest task body accepted
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.shared_secret == 0 {
        return Ok(next.run(request).await);
    }

    let (parts, body) = request.into_parts();
    let body_bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to read body: {}", e)))?;

    let json_value: Value = serde_json::from_slice(&body_bytes)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON: {}", e)))?;

    let token = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);

    verify_callback(
        token,
        &json_value,
        state.shared_secret,
        now_ms(),
        &state.auth_window,
    )
    .map_err(|e| {
        if let ApiAuthError::InvalidTimestamp { timestamp, now, .. } = &e {
            warn!(timestamp, now, "Rejected stale task token");
        } else {
            warn!(error = %e, "Rejected task token");
        }
        ApiError::Unauthorized(e.to_string())
    })?;

    let request = Request::from_parts(parts, Body::from(body_bytes));
    Ok(next.run(request).await)
}
