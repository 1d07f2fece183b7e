//! Database initialization
//!
//! Every pixtag service opens the same database file in the root folder.
//! Core tables (settings, task queue) are created here; the catalog table is
//! created by ingestion and the results table by provisioning, since both
//! names come from configuration.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Open (creating if needed) the shared database and its core tables
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // Concurrent worker appends need WAL; readers never block the writer
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_core_tables(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory database with core tables, for tests and dry runs
pub async fn init_memory_database() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;

    create_core_tables(&pool).await?;
    Ok(pool)
}

/// Idempotent creation of the tables every service relies on
pub async fn create_core_tables(pool: &SqlitePool) -> Result<()> {
    create_settings_table(pool).await?;
    create_task_queue_table(pool).await?;
    Ok(())
}

/// Key-value settings shared between services (holds the callback secret)
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Durable task queue. Several named queues share the table via `queue_id`.
pub async fn create_task_queue_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_queue (
            id TEXT PRIMARY KEY,
            queue_id TEXT NOT NULL,
            target_url TEXT NOT NULL,
            payload TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'pending'
                CHECK (state IN ('pending', 'in_flight', 'dead')),
            attempts INTEGER NOT NULL DEFAULT 0,
            deadline_secs INTEGER NOT NULL,
            next_attempt_at TEXT NOT NULL,
            lease_expires_at TEXT,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_task_queue_due ON task_queue(queue_id, state, next_attempt_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// True for names safe to splice into SQL as a table or column name
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Reject configured table names that are not plain identifiers
pub fn checked_table_name(name: &str) -> Result<String> {
    if is_identifier(name) {
        Ok(name.to_string())
    } else {
        Err(crate::Error::InvalidInput(format!(
            "'{}' is not a valid table name",
            name
        )))
    }
}

pub async fn table_exists(pool: &SqlitePool, table: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
    )
    .bind(table)
    .fetch_one(pool)
    .await?;

    Ok(exists)
}

/// Column names of `table` in declaration order
pub async fn table_columns(pool: &SqlitePool, table: &str) -> Result<Vec<String>> {
    let columns: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info(?) ORDER BY cid")
        .bind(table)
        .fetch_all(pool)
        .await?;

    Ok(columns)
}
