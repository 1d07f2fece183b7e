//! Queue depth, polled to observe completion of a dispatch cycle

use axum::{extract::State, Json};
use serde::Serialize;

use crate::{ApiResult, AppState};

#[derive(Debug, Serialize)]
pub struct QueueStatusResponse {
    pub queue_id: String,
    pub pending: i64,
    pub in_flight: i64,
    pub dead: i64,
    /// True when a new dispatch would be accepted
    pub idle: bool,
}

/// GET /queue
pub async fn queue_status(State(state): State<AppState>) -> ApiResult<Json<QueueStatusResponse>> {
    let queue = state.dispatcher.queue();
    let depth = queue.depth().await?;

    Ok(Json(QueueStatusResponse {
        queue_id: queue.queue_id().to_string(),
        pending: depth.pending,
        in_flight: depth.in_flight,
        dead: depth.dead,
        idle: depth.is_empty(),
    }))
}
