//! Task priority levels and the scan order derived from their weights.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// Priority of a task. Lower weight = dispatched first.
///
/// The discriminants are the default weights; `priority_weights` in the
/// config may override them, but every comparison goes through
/// [`PriorityOrder`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Critical = 0,
    High = 1,
    #[default]
    Medium = 2,
    Low = 3,
    Background = 4,
}

impl TaskPriority {
    pub const ALL: [TaskPriority; 5] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Medium,
        TaskPriority::Low,
        TaskPriority::Background,
    ];

    /// Default scheduling weight.
    pub fn weight(self) -> u32 {
        self as u32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskPriority::Critical => "CRITICAL",
            TaskPriority::High => "HIGH",
            TaskPriority::Medium => "MEDIUM",
            TaskPriority::Low => "LOW",
            TaskPriority::Background => "BACKGROUND",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskPriority::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DispatchError::InvalidPriority(s.to_string()))
    }
}

/// Order in which priority queues are scanned.
///
/// Built once from the configured weights. Ties fall back to the enum order,
/// so the result is always a total order over all five levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityOrder {
    levels: Vec<TaskPriority>,
}

impl PriorityOrder {
    pub fn from_weights(weights: &HashMap<TaskPriority, u32>) -> Self {
        let mut levels = TaskPriority::ALL.to_vec();
        levels.sort_by_key(|p| (weights.get(p).copied().unwrap_or(p.weight()), *p));
        Self { levels }
    }

    pub fn levels(&self) -> &[TaskPriority] {
        &self.levels
    }
}

impl Default for PriorityOrder {
    fn default() -> Self {
        Self::from_weights(&HashMap::new())
    }
}
