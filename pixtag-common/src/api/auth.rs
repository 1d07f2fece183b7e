//! Callback authentication via signed timestamp tokens
//!
//! The delivery runner signs every task it POSTs to the worker:
//!
//! ```text
//! Authorization: Bearer <timestamp_ms>.<sha256(canonical_json(body) + timestamp_ms + secret)>
//! ```
//!
//! - Canonical JSON has sorted keys and no whitespace
//! - The shared secret is an i64 in the `settings` table (`api_shared_secret`)
//! - A secret of 0 disables checking
//!
//! The task body format is fixed, so the signature travels in a header rather
//! than in the body.

use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::time::Duration;
use thiserror::Error;

const SECRET_KEY: &str = "api_shared_secret";

/// Authentication error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiAuthError {
    #[error("Missing authorization token")]
    MissingToken,

    #[error("Malformed authorization token: {0}")]
    MalformedToken(String),

    #[error("Invalid timestamp: {reason}")]
    InvalidTimestamp {
        timestamp: i64,
        now: i64,
        reason: String,
    },

    #[error("Invalid hash")]
    InvalidHash,

    #[error("Database error: {0}")]
    DatabaseError(String),
}

/// Accepted clock skew around the verifier's current time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthWindow {
    pub max_past: Duration,
    pub max_future: Duration,
}

impl Default for AuthWindow {
    fn default() -> Self {
        Self {
            max_past: Duration::from_secs(300),
            max_future: Duration::from_secs(5),
        }
    }
}

impl AuthWindow {
    pub fn with_max_past(max_past: Duration) -> Self {
        Self {
            max_past,
            ..Self::default()
        }
    }
}

/// Load shared secret from database settings, generating one on first use
pub async fn load_shared_secret(db: &SqlitePool) -> Result<i64, ApiAuthError> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(SECRET_KEY)
        .fetch_optional(db)
        .await
        .map_err(|e| ApiAuthError::DatabaseError(e.to_string()))?;

    match value {
        Some(value) => value
            .parse::<i64>()
            .map_err(|e| ApiAuthError::DatabaseError(format!("Invalid i64: {}", e))),
        None => initialize_shared_secret(db).await,
    }
}

/// Store a fresh random non-zero secret.
///
/// `INSERT OR IGNORE` keeps whichever secret a concurrently starting service
/// wrote first; the stored value is re-read and returned.
pub async fn initialize_shared_secret(db: &SqlitePool) -> Result<i64, ApiAuthError> {
    use rand::Rng;

    let secret: i64 = {
        let mut rng = rand::thread_rng();
        loop {
            let val = rng.gen::<i64>();
            if val != 0 {
                break val;
            }
        }
    };

    sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
        .bind(SECRET_KEY)
        .bind(secret.to_string())
        .execute(db)
        .await
        .map_err(|e| ApiAuthError::DatabaseError(e.to_string()))?;

    let stored: String = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(SECRET_KEY)
        .fetch_one(db)
        .await
        .map_err(|e| ApiAuthError::DatabaseError(e.to_string()))?;

    stored
        .parse::<i64>()
        .map_err(|e| ApiAuthError::DatabaseError(format!("Invalid i64: {}", e)))
}

/// Current Unix time in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Convert JSON to canonical form (sorted keys, no whitespace)
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let items: Vec<String> = pairs
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), to_canonical_json(v)))
                .collect();
            format!("{{{}}}", items.join(","))
        }
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(to_canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        // serde_json's compact form already escapes strings correctly
        other => other.to_string(),
    }
}

/// SHA-256 hex of canonical body, timestamp and secret
pub fn calculate_hash(body: &Value, timestamp: i64, shared_secret: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(to_canonical_json(body).as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    hasher.update(shared_secret.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Produce the token for `body` signed at `timestamp` (ms)
pub fn sign_callback(body: &Value, shared_secret: i64, timestamp: i64) -> String {
    format!("{}.{}", timestamp, calculate_hash(body, timestamp, shared_secret))
}

/// Strip the `Bearer ` scheme from an Authorization header value
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
}

pub fn validate_timestamp(timestamp: i64, now: i64, window: &AuthWindow) -> Result<(), ApiAuthError> {
    // The timestamp comes straight from the token, so any i64 can show up here
    let diff = now.checked_sub(timestamp).ok_or_else(|| ApiAuthError::InvalidTimestamp {
        timestamp,
        now,
        reason: "Timestamp out of range".to_string(),
    })?;
    let max_past = window.max_past.as_millis() as i64;
    let max_future = window.max_future.as_millis() as i64;

    if diff > max_past {
        return Err(ApiAuthError::InvalidTimestamp {
            timestamp,
            now,
            reason: format!("Timestamp {}ms too old (max {}ms past)", diff, max_past),
        });
    }

    if diff < 0 && diff.unsigned_abs() > max_future as u64 {
        return Err(ApiAuthError::InvalidTimestamp {
            timestamp,
            now,
            reason: format!(
                "Timestamp {}ms in future (max {}ms future)",
                diff.unsigned_abs(),
                max_future
            ),
        });
    }

    Ok(())
}

/// Check a callback token against the received body.
///
/// `token` is the header value with the scheme already stripped. A secret of
/// 0 accepts everything.
pub fn verify_callback(
    token: Option<&str>,
    body: &Value,
    shared_secret: i64,
    now: i64,
    window: &AuthWindow,
) -> Result<(), ApiAuthError> {
    if shared_secret == 0 {
        return Ok(());
    }

    let token = token.ok_or(ApiAuthError::MissingToken)?;
    let (timestamp, provided) = token
        .split_once('.')
        .ok_or_else(|| ApiAuthError::MalformedToken("expected <timestamp>.<hash>".to_string()))?;
    let timestamp: i64 = timestamp
        .parse()
        .map_err(|_| ApiAuthError::MalformedToken(format!("bad timestamp '{}'", timestamp)))?;

    validate_timestamp(timestamp, now, window)?;

    if calculate_hash(body, timestamp, shared_secret) != provided {
        return Err(ApiAuthError::InvalidHash);
    }

    Ok(())
}
