//! Shared HTTP API helpers
//!
//! Framework-free pieces only: callback token signing and verification plus
//! shared secret storage. Each service wraps these in its own middleware.

pub mod auth;

pub use auth::{
    bearer_token, calculate_hash, initialize_shared_secret, load_shared_secret, now_ms,
    sign_callback, to_canonical_json, validate_timestamp, verify_callback, ApiAuthError,
    AuthWindow,
};
