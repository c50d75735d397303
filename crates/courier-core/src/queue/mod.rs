//! Scheduling building blocks: ready queues, dependency gate, resource
//! accounting and retry policy.
//!
//! None of these types lock anything themselves; they are composed inside
//! the scheduler state, which sits behind the dispatcher's single mutex.

mod dependency;
mod priority;
mod resources;
mod retry;

pub use dependency::DependencyGate;
pub use priority::PriorityQueueSet;
pub use resources::ResourceAllocator;
pub use retry::{RetryDecision, RetryPolicy};
