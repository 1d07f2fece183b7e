//! Common error types for pixtag

use thiserror::Error;

/// Common result type for pixtag operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across pixtag services
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catalog snapshot missing or unreadable; aborts the selection cycle
    #[error("Selection error: {0}")]
    Selection(String),

    /// Target queue still has pending or in-flight tasks
    #[error("Queue busy: {pending} pending, {in_flight} in flight")]
    QueueBusy { pending: i64, in_flight: i64 },

    /// Type description could not be compiled into a storage schema
    #[error("Schema compile error: {0}")]
    SchemaCompile(#[from] crate::schema::SchemaCompileError),

    /// Results table exists with a different column set
    #[error("Results table '{table}' does not match the compiled schema; reprovision required ({detail})")]
    SchemaMismatch { table: String, detail: String },

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
