//! Task endpoint

use axum::{body::Bytes, extract::State, Json};
use pixtag_common::ClassificationTask;

use crate::{ApiError, ApiResult, AppState, TaskSummary};

/// POST /
///
/// 200 with the task summary when every fetched image was classified and
/// stored; any task failure is a non-2xx response so the queue retries.
pub async fn classify_product(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<TaskSummary>> {
    let task: ClassificationTask = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid task: {}", e)))?;

    match state.worker.process(&task).await {
        Ok(summary) => Ok(Json(summary)),
        Err(e) => {
            *state.last_error.write().await = Some(format!("{}: {}", task.offer_id(), e));
            Err(e.into())
        }
    }
}
