//! pixtag-pp library - push products for classification
//!
//! Selects unclassified product images from the latest catalog batch,
//! dispatches one task per product to the queue, and delivers queued tasks to
//! the classification worker.

use axum::Router;
use chrono::{DateTime, Utc};
use pixtag_common::config::PixtagConfig;
use pixtag_common::queue::{SqliteTaskQueue, TaskQueue};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

pub mod api;
pub mod delivery;
pub mod dispatcher;
pub mod error;

pub use delivery::{DeliveryRunner, DeliveryStats};
pub use dispatcher::Dispatcher;
pub use error::{ApiError, ApiResult};

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool (catalog, results and queue tables)
    pub db: SqlitePool,
    pub config: Arc<PixtagConfig>,
    pub dispatcher: Dispatcher,
    /// Service start time, for uptime reporting
    pub startup_time: DateTime<Utc>,
    /// Last dispatch error, reported by /health
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    /// State backed by the SQLite queue named in `config`
    pub fn new(db: SqlitePool, config: PixtagConfig) -> Self {
        let queue = Arc::new(SqliteTaskQueue::new(db.clone(), config.queue.id.clone()));
        Self::with_queue(db, config, queue)
    }

    pub fn with_queue(db: SqlitePool, config: PixtagConfig, queue: Arc<dyn TaskQueue>) -> Self {
        let dispatcher = Dispatcher::new(queue, task_deadline(&config));
        Self {
            db,
            config: Arc::new(config),
            dispatcher,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn record_error(&self, message: impl Into<String>) {
        *self.last_error.write().await = Some(message.into());
    }
}

/// Delivery deadline for one classification task
pub fn task_deadline(config: &PixtagConfig) -> Duration {
    Duration::from_secs(config.worker.task_timeout_secs)
}

/// Build application router
///
/// The trigger endpoint carries no callback token; it is meant to be bound to
/// a local address and called by a scheduler.
pub fn build_router(state: AppState) -> Router {
    use axum::routing::{get, post};

    Router::new()
        .route("/", post(api::push_products))
        .route("/push", post(api::push_products))
        .route("/queue", get(api::queue_status))
        .merge(api::health_routes())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
