//! Task queue abstraction and its SQLite implementation
//!
//! The queue gives at-least-once delivery: a claimed task stays in the table
//! (state `in_flight`) until it is acked, failed, or its lease expires. Failed
//! tasks are retried with exponential backoff and dead-lettered after the
//! configured number of attempts. Dead tasks are kept for inspection and are
//! never redelivered automatically.

use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Extra lease time on top of a task's deadline before it is redelivered
const LEASE_GRACE: Duration = Duration::from_secs(30);

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt `attempt` (1-based):
    /// `min_backoff * 2^(attempt-1)`, capped at `max_backoff`
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.min_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Delivery throttles applied by the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub max_concurrent_dispatches: u32,
    pub max_dispatches_per_second: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            max_concurrent_dispatches: 10,
            max_dispatches_per_second: 5,
        }
    }
}

/// Observable queue depth
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub pending: i64,
    pub in_flight: i64,
    pub dead: i64,
}

impl QueueDepth {
    /// No pending or in-flight work. Dead letters do not count.
    pub fn is_empty(&self) -> bool {
        self.pending == 0 && self.in_flight == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    /// Endpoint the task body is POSTed to
    pub target_url: String,
    pub payload: Value,
    /// Per-delivery deadline (request timeout)
    pub deadline: Duration,
}

/// Producer-side view of a queue
#[async_trait]
pub trait TaskQueue: Send + Sync {
    fn queue_id(&self) -> &str;

    async fn depth(&self) -> Result<QueueDepth>;

    /// Add one task; returns its id
    async fn enqueue(&self, request: EnqueueRequest) -> Result<String>;

    /// Add a whole batch, but only while no task is pending or in flight.
    ///
    /// The emptiness check and the inserts happen as one step: of two
    /// concurrent calls on an idle queue, exactly one gets its batch in and
    /// the other fails with [`Error::QueueBusy`] having added nothing.
    async fn enqueue_batch_if_idle(&self, requests: Vec<EnqueueRequest>) -> Result<Vec<String>>;
}

/// A task claimed for delivery
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTask {
    pub id: String,
    pub target_url: String,
    pub payload: Value,
    /// Delivery attempts including the current one
    pub attempts: u32,
    pub deadline: Duration,
}

/// What `fail` did with the task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retry { next_attempt_at: DateTime<Utc> },
    DeadLettered,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub id: String,
    pub payload: Value,
    pub attempts: u32,
    pub last_error: Option<String>,
}

fn ts(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36500))
}

/// SQLite-backed queue. Rows live in `task_queue`, partitioned by queue id.
#[derive(Debug, Clone)]
pub struct SqliteTaskQueue {
    pool: SqlitePool,
    queue_id: String,
}

impl SqliteTaskQueue {
    pub fn new(pool: SqlitePool, queue_id: impl Into<String>) -> Self {
        Self {
            pool,
            queue_id: queue_id.into(),
        }
    }

    /// Claim up to `limit` tasks that are due now
    pub async fn claim_due(&self, limit: u32, policy: &RetryPolicy) -> Result<Vec<QueuedTask>> {
        self.claim_due_at(limit, policy, Utc::now()).await
    }

    /// Claim due tasks as of `now`. Pending tasks past `next_attempt_at` and
    /// in-flight tasks whose lease expired are both eligible.
    ///
    /// An expired lease counts as a failed attempt: a task whose lease ran
    /// out on its last allowed attempt is dead-lettered instead of claimed.
    pub async fn claim_due_at(
        &self,
        limit: u32,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueuedTask>> {
        let now_text = ts(now);
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT id, state, target_url, payload, attempts, deadline_secs
            FROM task_queue
            WHERE queue_id = ?
              AND ((state = 'pending' AND next_attempt_at <= ?)
                OR (state = 'in_flight' AND lease_expires_at <= ?))
            ORDER BY next_attempt_at, created_at
            LIMIT ?
            "#,
        )
        .bind(&self.queue_id)
        .bind(&now_text)
        .bind(&now_text)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        let mut expired = 0;
        for row in rows {
            let id: String = row.try_get("id")?;
            let state: String = row.try_get("state")?;
            let attempts: i64 = row.try_get("attempts")?;

            if state == "in_flight" && attempts >= policy.max_attempts as i64 {
                sqlx::query(
                    r#"
                    UPDATE task_queue
                    SET state = 'dead', lease_expires_at = NULL, last_error = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(format!("lease expired after {} attempts", attempts))
                .bind(&now_text)
                .bind(&id)
                .execute(&mut *tx)
                .await?;

                warn!(
                    queue = %self.queue_id,
                    task_id = %id,
                    attempts,
                    "Task dead-lettered after its final lease expired"
                );
                expired += 1;
                continue;
            }

            let deadline = Duration::from_secs(row.try_get::<i64, _>("deadline_secs")?.max(0) as u64);
            let payload: String = row.try_get("payload")?;
            let lease_expires = now + chrono_duration(deadline + LEASE_GRACE);

            sqlx::query(
                r#"
                UPDATE task_queue
                SET state = 'in_flight', attempts = attempts + 1,
                    lease_expires_at = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(ts(lease_expires))
            .bind(&now_text)
            .bind(&id)
            .execute(&mut *tx)
            .await?;

            claimed.push(QueuedTask {
                id,
                target_url: row.try_get("target_url")?,
                payload: serde_json::from_str(&payload)?,
                attempts: (attempts + 1) as u32,
                deadline,
            });
        }

        tx.commit().await?;

        if !claimed.is_empty() || expired > 0 {
            debug!(
                queue = %self.queue_id,
                claimed = claimed.len(),
                dead_lettered = expired,
                "Claimed due tasks"
            );
        }
        Ok(claimed)
    }

    /// Delivery succeeded: remove the task
    pub async fn ack(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM task_queue WHERE id = ? AND queue_id = ?")
            .bind(id)
            .bind(&self.queue_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("task {}", id)));
        }
        Ok(())
    }

    /// Delivery failed: schedule a retry, or dead-letter once attempts run out
    pub async fn fail(&self, id: &str, error: &str, policy: &RetryPolicy) -> Result<FailOutcome> {
        self.fail_at(id, error, policy, Utc::now()).await
    }

    pub async fn fail_at(
        &self,
        id: &str,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome> {
        let attempts: Option<i64> =
            sqlx::query_scalar("SELECT attempts FROM task_queue WHERE id = ? AND queue_id = ?")
                .bind(id)
                .bind(&self.queue_id)
                .fetch_optional(&self.pool)
                .await?;
        let attempts = attempts.ok_or_else(|| Error::NotFound(format!("task {}", id)))? as u32;

        if attempts >= policy.max_attempts {
            sqlx::query(
                r#"
                UPDATE task_queue
                SET state = 'dead', lease_expires_at = NULL, last_error = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(error)
            .bind(ts(now))
            .bind(id)
            .execute(&self.pool)
            .await?;

            warn!(
                queue = %self.queue_id,
                task_id = id,
                attempts,
                error,
                "Task dead-lettered after exhausting retries"
            );
            return Ok(FailOutcome::DeadLettered);
        }

        let next_attempt_at = now + chrono_duration(policy.backoff_for(attempts));
        sqlx::query(
            r#"
            UPDATE task_queue
            SET state = 'pending', next_attempt_at = ?, lease_expires_at = NULL,
                last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(ts(next_attempt_at))
        .bind(error)
        .bind(ts(now))
        .bind(id)
        .execute(&self.pool)
        .await?;

        debug!(
            queue = %self.queue_id,
            task_id = id,
            attempts,
            next_attempt_at = %next_attempt_at,
            "Task scheduled for retry"
        );
        Ok(FailOutcome::Retry { next_attempt_at })
    }

    /// Return every in-flight task to pending. Run at runner startup, when
    /// no delivery from an earlier process can still be running.
    pub async fn recover_in_flight(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE task_queue
            SET state = 'pending', lease_expires_at = NULL, updated_at = ?
            WHERE queue_id = ? AND state = 'in_flight'
            "#,
        )
        .bind(ts(Utc::now()))
        .bind(&self.queue_id)
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            info!(queue = %self.queue_id, count, "Recovered in-flight tasks");
        }
        Ok(count)
    }

    pub async fn dead_letters(&self, limit: u32) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            r#"
            SELECT id, payload, attempts, last_error FROM task_queue
            WHERE queue_id = ? AND state = 'dead'
            ORDER BY updated_at DESC
            LIMIT ?
            "#,
        )
        .bind(&self.queue_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let payload: String = row.try_get("payload")?;
                Ok(DeadLetter {
                    id: row.try_get("id")?,
                    payload: serde_json::from_str(&payload)?,
                    attempts: row.try_get::<i64, _>("attempts")? as u32,
                    last_error: row.try_get("last_error")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl TaskQueue for SqliteTaskQueue {
    fn queue_id(&self) -> &str {
        &self.queue_id
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT state, COUNT(*) FROM task_queue WHERE queue_id = ? GROUP BY state",
        )
        .bind(&self.queue_id)
        .fetch_all(&self.pool)
        .await?;

        let mut depth = QueueDepth::default();
        for (state, count) in rows {
            match state.as_str() {
                "pending" => depth.pending = count,
                "in_flight" => depth.in_flight = count,
                "dead" => depth.dead = count,
                other => warn!(state = other, "Unknown task state in queue"),
            }
        }
        Ok(depth)
    }

    async fn enqueue(&self, request: EnqueueRequest) -> Result<String> {
        let mut conn = self.pool.acquire().await?;
        insert_task(&mut conn, &self.queue_id, &request, &ts(Utc::now())).await
    }

    async fn enqueue_batch_if_idle(&self, requests: Vec<EnqueueRequest>) -> Result<Vec<String>> {
        let pool = self.pool.clone();
        let queue_id = self.queue_id.clone();

        // Detached, so a caller dropped mid-batch cannot leave the write lock held
        tokio::spawn(async move { insert_batch_if_idle(&pool, &queue_id, &requests).await })
            .await
            .map_err(|e| Error::Internal(format!("enqueue task aborted: {}", e)))?
    }
}

async fn insert_task(
    conn: &mut SqliteConnection,
    queue_id: &str,
    request: &EnqueueRequest,
    now: &str,
) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();

    sqlx::query(
        r#"
        INSERT INTO task_queue (id, queue_id, target_url, payload, state, attempts,
                                deadline_secs, next_attempt_at, created_at, updated_at)
        VALUES (?, ?, ?, ?, 'pending', 0, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(queue_id)
    .bind(&request.target_url)
    .bind(serde_json::to_string(&request.payload)?)
    .bind(request.deadline.as_secs() as i64)
    .bind(now)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(id)
}

/// Check-then-insert under `BEGIN IMMEDIATE`, which takes the write lock
/// before the depth read. A second writer waits on the busy timeout.
async fn insert_batch_if_idle(
    pool: &SqlitePool,
    queue_id: &str,
    requests: &[EnqueueRequest],
) -> Result<Vec<String>> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

    let result = insert_batch_locked(&mut conn, queue_id, requests).await;

    let finish = if result.is_ok() { "COMMIT" } else { "ROLLBACK" };
    if let Err(e) = sqlx::query(finish).execute(&mut *conn).await {
        if result.is_ok() {
            sqlx::query("ROLLBACK").execute(&mut *conn).await.ok();
            return Err(e.into());
        }
        warn!(queue = queue_id, error = %e, "Rollback after failed batch enqueue failed");
    }

    result
}

async fn insert_batch_locked(
    conn: &mut SqliteConnection,
    queue_id: &str,
    requests: &[EnqueueRequest],
) -> Result<Vec<String>> {
    let (pending, in_flight): (i64, i64) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(state = 'pending'), 0), COALESCE(SUM(state = 'in_flight'), 0)
        FROM task_queue
        WHERE queue_id = ?
        "#,
    )
    .bind(queue_id)
    .fetch_one(&mut *conn)
    .await?;

    if pending > 0 || in_flight > 0 {
        return Err(Error::QueueBusy { pending, in_flight });
    }

    let now = ts(Utc::now());
    let mut ids = Vec::with_capacity(requests.len());
    for request in requests {
        ids.push(insert_task(conn, queue_id, request, &now).await?);
    }
    Ok(ids)
}
