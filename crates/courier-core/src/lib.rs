//! courier-core
//!
//! In-process task dispatcher for AI agent work: prioritized queues,
//! dependency gating, resource accounting, retries with backoff and a
//! fixed worker pool on tokio.
//!
//! # モジュール構成
//! - **domain**: Task / TaskRequest / TaskPriority / TaskStatus
//! - **queue**: ready queue, dependency gate, resource allocator, retry policy
//! - **runtime**: AgentHandler trait と HandlerRegistry
//! - **dispatcher**: 公開 facade（add_task, cancel_task, shutdown など）
//! - **config / metrics / clock / error**: 周辺

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod runtime;

mod scheduler;
mod worker;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{DependencyFailurePolicy, DispatcherConfig, RetryConfig};
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use domain::{Task, TaskId, TaskPriority, TaskRequest, TaskStatus};
pub use error::DispatchError;
pub use metrics::PerformanceMetrics;
pub use runtime::{AgentHandler, HandlerRegistry};

// handler 実装側が依存を増やさずに済むように
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
