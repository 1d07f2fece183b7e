//! HTTP API handlers for pixtag-cp

pub mod auth;
pub mod classify;
pub mod health;

pub use auth::auth_middleware;
pub use classify::classify_product;
pub use health::health_routes;
