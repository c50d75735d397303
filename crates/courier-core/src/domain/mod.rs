//! Domain model: task identity, priority and status.

pub mod priority;
pub mod status;
pub mod task;

pub use priority::{PriorityOrder, TaskPriority};
pub use status::TaskStatus;
pub use task::{MAX_RETRIES_KEY, REQUIRED_RESOURCES_KEY, Task, TaskId, TaskRequest};
