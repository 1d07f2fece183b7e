//! Queue delivery runner
//!
//! Pulls due tasks from the SQLite queue and POSTs each one to its target
//! endpoint with a signed callback token. A 2xx response acks the task; any
//! other outcome hands it back to the queue's retry policy.
//!
//! Concurrency is capped by a semaphore (`max_concurrent_dispatches`) and the
//! send rate by a governor limiter (`max_dispatches_per_second`).

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use pixtag_common::api::auth::{now_ms, sign_callback};
use pixtag_common::queue::{FailOutcome, QueuedTask, RateLimits, RetryPolicy, SqliteTaskQueue, TaskQueue};
use pixtag_common::{Error, Result};
use serde::Serialize;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Longest response body excerpt kept in a task's last_error
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Retrying,
    DeadLettered,
    /// The queue could not record the outcome; the lease will expire and
    /// the task will be redelivered
    Unrecorded,
}

#[derive(Debug, Default)]
struct Counters {
    acked: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub acked: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

/// Everything a spawned delivery needs
#[derive(Clone)]
struct DeliveryContext {
    queue: SqliteTaskQueue,
    client: reqwest::Client,
    shared_secret: i64,
    policy: RetryPolicy,
    counters: Arc<Counters>,
}

impl DeliveryContext {
    async fn deliver(&self, task: QueuedTask) -> DeliveryOutcome {
        let token = sign_callback(&task.payload, self.shared_secret, now_ms());

        let result = self
            .client
            .post(&task.target_url)
            .timeout(task.deadline)
            .bearer_auth(token)
            .json(&task.payload)
            .send()
            .await;

        let failure = match result {
            Ok(response) if response.status().is_success() => None,
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let excerpt: String = body.chars().take(ERROR_BODY_LIMIT).collect();
                Some(format!("HTTP {}: {}", status, excerpt))
            }
            Err(e) if e.is_timeout() => Some(format!("deadline of {:?} exceeded", task.deadline)),
            Err(e) => Some(format!("request failed: {}", e)),
        };

        match failure {
            None => match self.queue.ack(&task.id).await {
                Ok(()) => {
                    self.counters.acked.fetch_add(1, Ordering::Relaxed);
                    debug!(task_id = %task.id, attempts = task.attempts, "Task delivered");
                    DeliveryOutcome::Acked
                }
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "Failed to ack delivered task");
                    DeliveryOutcome::Unrecorded
                }
            },
            Some(reason) => match self.queue.fail(&task.id, &reason, &self.policy).await {
                Ok(FailOutcome::Retry { next_attempt_at }) => {
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        task_id = %task.id,
                        attempts = task.attempts,
                        next_attempt_at = %next_attempt_at,
                        reason = %reason,
                        "Delivery failed, will retry"
                    );
                    DeliveryOutcome::Retrying
                }
                Ok(FailOutcome::DeadLettered) => {
                    self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    error!(
                        task_id = %task.id,
                        offer_id = task.payload["offer_id"].as_str().unwrap_or_default(),
                        attempts = task.attempts,
                        reason = %reason,
                        "Delivery failed permanently, task dead-lettered"
                    );
                    DeliveryOutcome::DeadLettered
                }
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "Failed to record delivery failure");
                    DeliveryOutcome::Unrecorded
                }
            },
        }
    }
}

pub struct DeliveryRunner {
    ctx: DeliveryContext,
    limiter: Arc<DefaultDirectRateLimiter>,
    permits: Arc<Semaphore>,
    max_concurrent: u32,
    poll_interval: Duration,
}

impl DeliveryRunner {
    pub fn new(
        queue: SqliteTaskQueue,
        shared_secret: i64,
        policy: RetryPolicy,
        limits: RateLimits,
        poll_interval: Duration,
    ) -> Result<Self> {
        let per_second = NonZeroU32::new(limits.max_dispatches_per_second)
            .ok_or_else(|| Error::Config("max_dispatches_per_second must be non-zero".to_string()))?;
        let max_concurrent = limits.max_concurrent_dispatches.max(1);

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            ctx: DeliveryContext {
                queue,
                client,
                shared_secret,
                policy,
                counters: Arc::new(Counters::default()),
            },
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(per_second))),
            permits: Arc::new(Semaphore::new(max_concurrent as usize)),
            max_concurrent,
            poll_interval,
        })
    }

    pub fn stats(&self) -> DeliveryStats {
        let c = &self.ctx.counters;
        DeliveryStats {
            acked: c.acked.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
        }
    }

    /// Claim as many due tasks as there are free permits and start them
    async fn pump(&self) -> Result<usize> {
        let available = self.permits.available_permits();
        if available == 0 {
            return Ok(0);
        }

        let tasks = self.ctx.queue.claim_due(available as u32, &self.ctx.policy).await?;
        let started = tasks.len();

        for task in tasks {
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::Internal("delivery semaphore closed".to_string()))?;
            self.limiter.until_ready().await;

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                let _permit = permit;
                ctx.deliver(task).await;
            });
        }

        Ok(started)
    }

    fn idle(&self) -> bool {
        self.permits.available_permits() == self.max_concurrent as usize
    }

    /// Wait for running deliveries to finish
    async fn drain(&self) {
        if let Ok(all) = self.permits.acquire_many(self.max_concurrent).await {
            drop(all);
        }
    }

    /// Deliver until `shutdown` resolves, then let running deliveries finish
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.ctx.queue.recover_in_flight().await?;
        info!(queue = self.ctx.queue.queue_id(), "Delivery runner started");

        tokio::pin!(shutdown);
        loop {
            let started = match self.pump().await {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "Failed to claim due tasks");
                    0
                }
            };

            if started == 0 {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        self.drain().await;
        info!(stats = ?self.stats(), "Delivery runner stopped");
        Ok(())
    }

    /// Deliver until the queue has nothing pending or in flight.
    ///
    /// Waits out retry backoff, so a failing endpoint keeps this running
    /// until its tasks are dead-lettered.
    pub async fn run_until_idle(&self) -> Result<DeliveryStats> {
        self.ctx.queue.recover_in_flight().await?;

        loop {
            let started = self.pump().await?;
            if started == 0 {
                if self.idle() && self.ctx.queue.depth().await?.is_empty() {
                    break;
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        self.drain().await;
        Ok(self.stats())
    }
}
