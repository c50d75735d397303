//! Task status state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Task status.
///
/// State transitions:
/// - Pending -> Running -> Completed
/// - Pending -> Running -> Retrying -> Running (until max_retries)
/// - Pending -> Running -> Failed (retries exhausted)
/// - Pending -> Cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Queued, waiting for its first run.
    Pending,

    /// Currently being executed by a worker.
    Running,

    /// Failed at least once and re-queued.
    Retrying,

    Completed,

    /// Failed permanently.
    Failed,

    Cancelled,
}

impl TaskStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the state machine allows `self -> next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Retrying)
                | (Running, Failed)
                | (Retrying, Running)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Retrying => "RETRYING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}
