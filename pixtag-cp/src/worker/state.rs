//! Per-task state tracking

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Received,
    Fetching,
    Hashing,
    InvokingModel,
    Validating,
    Persisting,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }

    /// Legal forward moves. Any non-terminal state may fail; a task with no
    /// images goes straight from Received to Done.
    fn can_advance_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (s, Failed) => !s.is_terminal(),
            (Received, Fetching) | (Received, Done) => true,
            (Fetching, Hashing) => true,
            (Hashing, InvokingModel) => true,
            (InvokingModel, Validating) => true,
            (Validating, Persisting) => true,
            (Persisting, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Received => "received",
            TaskState::Fetching => "fetching",
            TaskState::Hashing => "hashing",
            TaskState::InvokingModel => "invoking_model",
            TaskState::Validating => "validating",
            TaskState::Persisting => "persisting",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub state: TaskState,
    pub at: DateTime<Utc>,
}

/// Transition history of one task
#[derive(Debug, Clone, Serialize)]
pub struct TaskRun {
    pub offer_id: String,
    pub transitions: Vec<Transition>,
    #[serde(skip)]
    started: Instant,
}

impl TaskRun {
    pub fn new(offer_id: &str) -> Self {
        Self {
            offer_id: offer_id.to_string(),
            transitions: vec![Transition {
                state: TaskState::Received,
                at: Utc::now(),
            }],
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> TaskState {
        self.transitions
            .last()
            .map(|t| t.state)
            .unwrap_or(TaskState::Received)
    }

    /// Record a transition. Illegal moves are logged and ignored.
    pub fn advance(&mut self, next: TaskState) {
        let current = self.state();
        if !current.can_advance_to(next) {
            tracing::warn!(
                offer_id = %self.offer_id,
                from = %current,
                to = %next,
                "Ignoring illegal task state transition"
            );
            return;
        }

        tracing::debug!(
            offer_id = %self.offer_id,
            from = %current,
            to = %next,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Task state"
        );
        self.transitions.push(Transition {
            state: next,
            at: Utc::now(),
        });
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}
