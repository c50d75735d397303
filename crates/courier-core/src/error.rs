use thiserror::Error;

use crate::domain::TaskId;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    #[error("handler not found for agent_type={0}")]
    HandlerNotFound(String),

    #[error("duplicate handler for agent_type={0}")]
    DuplicateHandler(String),

    /// Returned by a handler to report a failed execution.
    #[error("handler failed: {0}")]
    Handler(String),

    #[error("handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("invalid task payload: {0}")]
    InvalidPayload(String),

    #[error("invalid task metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid priority: {0}")]
    InvalidPriority(String),

    #[error("dispatcher is shutting down")]
    ShuttingDown,

    #[error("abandoned at shutdown")]
    Abandoned,

    #[error("invalid config: {0}")]
    Config(String),
}

impl DispatchError {
    /// Shorthand for handlers reporting a failure.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}
