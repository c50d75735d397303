//! Dispatcher facade: the only entry point applications use.
//!
//! ```no_run
//! # use courier_core::{Dispatcher, DispatcherConfig, HandlerRegistry, TaskRequest};
//! # async fn demo(registry: HandlerRegistry) -> Result<(), courier_core::DispatchError> {
//! let dispatcher = Dispatcher::builder()
//!     .config(DispatcherConfig::default())
//!     .registry(registry)
//!     .start()?;
//!
//! let id = dispatcher.add_task(TaskRequest::new("chat", "reply")).await?;
//! let task = dispatcher.get_task_status(&id).await;
//! dispatcher.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::DispatcherConfig;
use crate::domain::{Task, TaskId, TaskRequest};
use crate::error::DispatchError;
use crate::metrics::PerformanceMetrics;
use crate::runtime::{HandlerRegistry, Runtime};
use crate::scheduler::SchedulerState;
use crate::worker::{Shared, WorkerPool};

/// Poll interval used by the `wait_*` helpers.
const WAIT_POLL: Duration = Duration::from_millis(10);

pub struct DispatcherBuilder {
    config: DispatcherConfig,
    registry: HandlerRegistry,
    clock: Arc<dyn Clock>,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self {
            config: DispatcherConfig::default(),
            registry: HandlerRegistry::new(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl DispatcherBuilder {
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the config and spawn the workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Result<Dispatcher, DispatchError> {
        self.config.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(DispatchError::Config("dispatcher must be started inside a tokio runtime".into()));
        }

        let workers = self.config.resolved_max_workers();
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState::new(&self.config)),
            wake: Notify::new(),
            runtime: Runtime::new(Arc::new(self.registry)),
            clock: self.clock,
        });
        let pool = WorkerPool::spawn(workers, Arc::clone(&shared), self.config.min_batch_interval());
        info!(
            workers,
            agent_types = ?shared.runtime.registry().agent_types(),
            "dispatcher started"
        );

        Ok(Dispatcher {
            shared,
            pool,
            shutdown_grace: self.config.shutdown_grace(),
        })
    }
}

/// Accepts tasks, runs them on the worker pool and reports on them.
///
/// Dropping the dispatcher stops the workers without waiting; call
/// [`Dispatcher::shutdown`] for a graceful stop.
pub struct Dispatcher {
    shared: Arc<Shared>,
    pool: WorkerPool,
    shutdown_grace: Duration,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Start a dispatcher from `builder`, run `f` with it, then shut it down.
    pub async fn scoped<F, Fut, T>(builder: DispatcherBuilder, f: F) -> Result<T, DispatchError>
    where
        F: FnOnce(Arc<Dispatcher>) -> Fut,
        Fut: Future<Output = T>,
    {
        let dispatcher = Arc::new(builder.start()?);
        let out = f(Arc::clone(&dispatcher)).await;
        dispatcher.shutdown().await;
        Ok(out)
    }

    /// Submit a task. Returns its id; never waits for execution.
    pub async fn add_task(&self, request: TaskRequest) -> Result<TaskId, DispatchError> {
        let id = {
            let mut state = self.shared.state.lock().await;
            state.submit(request, self.shared.clock.now())?
        };
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Cancel a task that has not started yet.
    ///
    /// Returns false for unknown, running, retrying or finished tasks.
    pub async fn cancel_task(&self, task_id: &TaskId) -> bool {
        let cancelled = {
            let mut state = self.shared.state.lock().await;
            state.cancel(task_id, self.shared.clock.now())
        };
        if cancelled {
            // dependents may have been cancelled too; nothing new to run, but
            // idle workers re-check anyway
            self.shared.wake.notify_waiters();
        }
        cancelled
    }

    /// Snapshot of a task, whether active or finished.
    pub async fn get_task_status(&self, task_id: &TaskId) -> Option<Task> {
        self.shared.state.lock().await.get(task_id)
    }

    pub async fn get_performance_metrics(&self) -> PerformanceMetrics {
        self.shared.state.lock().await.metrics()
    }

    /// Wait until `task_id` reaches a terminal status, or `timeout` elapses.
    ///
    /// Returns the last snapshot seen (None if the id is unknown).
    pub async fn wait_for_task(&self, task_id: &TaskId, timeout: Duration) -> Option<Task> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let task = self.get_task_status(task_id).await?;
            if task.status().is_terminal() || tokio::time::Instant::now() >= deadline {
                return Some(task);
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    /// Wait until nothing is queued or running. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.shared.state.lock().await.is_idle() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    /// Stop accepting tasks, let in-flight handlers finish within the grace
    /// period and abandon the rest (they end FAILED).
    ///
    /// Queued tasks stay where they are. Calling this again has no effect.
    pub async fn shutdown(&self) {
        let first = {
            let mut state = self.shared.state.lock().await;
            let first = state.is_accepting();
            state.close();
            first
        };
        if first {
            info!(grace_ms = self.shutdown_grace.as_millis() as u64, "dispatcher shutting down");
        }
        self.pool.shutdown(self.shutdown_grace).await;
        if first {
            let metrics = self.get_performance_metrics().await;
            info!(
                total = metrics.total_tasks,
                successful = metrics.successful_tasks,
                failed = metrics.failed_tasks,
                cancelled = metrics.cancelled_tasks,
                "dispatcher stopped"
            );
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.pool.request_shutdown();
        self.pool.abandon();
    }
}
