//! pixtag-cp library - classify product images
//!
//! HTTP worker that receives one classification task per product from the
//! queue, classifies its images with a multimodal model and appends the
//! results to the Results Store.

use axum::Router;
use chrono::{DateTime, Utc};
use pixtag_common::api::auth::AuthWindow;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod api;
pub mod error;
pub mod fetch;
pub mod hashing;
pub mod model;
pub mod worker;

pub use error::{ApiError, ApiResult, FetchError, ModelError, TaskError};
pub use worker::{ClassificationWorker, TaskSummary};

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub worker: Arc<ClassificationWorker>,
    /// Callback secret; 0 disables token checking
    pub shared_secret: i64,
    pub auth_window: AuthWindow,
    pub startup_time: DateTime<Utc>,
    /// Last task failure, reported by /health
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(worker: ClassificationWorker, shared_secret: i64, auth_window: AuthWindow) -> Self {
        Self {
            worker: Arc::new(worker),
            shared_secret,
            auth_window,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }
}

/// Build application router
///
/// Task delivery requires a valid callback token; /health is public.
pub fn build_router(state: AppState) -> Router {
    use axum::middleware;
    use axum::routing::post;

    let protected = Router::new()
        .route("/", post(api::classify_product))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api::auth_middleware,
        ));

    let public = Router::new().merge(api::health_routes());

    Router::new()
        .merge(protected)
        .merge(public)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
