//! HTTP API handlers for pixtag-pp

pub mod health;
pub mod push;
pub mod queue;

pub use health::health_routes;
pub use push::push_products;
pub use queue::queue_status;
