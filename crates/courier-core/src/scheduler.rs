//! Scheduler state: every task record plus the queue, dependency, resource
//! and metrics bookkeeping that decides what runs next.
//!
//! Nothing here is async or locked. The dispatcher keeps one
//! `SchedulerState` behind a single mutex; each method is one critical
//! section, and no handler code ever runs while it is held.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::{DependencyFailurePolicy, DispatcherConfig};
use crate::domain::{Task, TaskId, TaskRequest, TaskStatus};
use crate::error::DispatchError;
use crate::metrics::{MetricsCollector, PerformanceMetrics};
use crate::queue::{DependencyGate, PriorityQueueSet, ResourceAllocator, RetryDecision, RetryPolicy};

/// What `finish` did with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Completed,
    /// Re-queued for retry number `attempt`.
    Retrying { attempt: u32 },
    Failed,
}

#[derive(Debug)]
pub struct SchedulerState {
    queues: PriorityQueueSet,
    /// Tasks still PENDING, RUNNING or RETRYING.
    active: HashMap<TaskId, Task>,
    /// Tasks in a terminal status.
    completed: HashMap<TaskId, Task>,
    resources: ResourceAllocator,
    dependencies: DependencyGate,
    metrics: MetricsCollector,
    retry_policy: RetryPolicy,
    dependency_failure: DependencyFailurePolicy,
    default_max_retries: u32,
    scan_limit: usize,
    accepting: bool,
}

impl SchedulerState {
    pub fn new(config: &DispatcherConfig) -> Self {
        Self {
            queues: PriorityQueueSet::new(config.priority_order()),
            active: HashMap::new(),
            completed: HashMap::new(),
            resources: ResourceAllocator::new(config.resource_limits.clone()),
            dependencies: DependencyGate::new(),
            metrics: MetricsCollector::new(),
            retry_policy: config.retry_policy(),
            dependency_failure: config.dependency_failure,
            default_max_retries: config.default_max_retries,
            scan_limit: config.batch_size.max(1),
            accepting: true,
        }
    }

    /// Validate a request, assign its id and enqueue it as PENDING.
    pub fn submit(&mut self, request: TaskRequest, now: DateTime<Utc>) -> Result<TaskId, DispatchError> {
        if !self.accepting {
            return Err(DispatchError::ShuttingDown);
        }

        let id = self.unique_id(&request.agent_type, &request.task_type, now);
        if let Some(dependency) = request
            .dependencies
            .iter()
            .find(|dep| !self.active.contains_key(*dep) && !self.completed.contains_key(*dep))
        {
            return Err(DispatchError::UnknownDependency {
                task: id,
                dependency: dependency.clone(),
            });
        }

        let task = Task::from_request(id.clone(), request, now, self.default_max_retries)?;
        if !self.resources.is_satisfiable(&task) {
            warn!(
                task_id = %id,
                resources = ?task.required_resources(),
                "task requires more than a configured resource limit; it will never be admitted"
            );
        }

        self.dependencies.register(&task);
        self.metrics.record_submitted();
        self.queues.push(task.priority(), id.clone());
        let failed_dependency = self.dependencies.failed_dependency(&task);
        debug!(
            task_id = %id,
            agent_type = task.agent_type(),
            priority = %task.priority(),
            dependencies = task.dependencies().len(),
            "task submitted"
        );
        self.active.insert(id.clone(), task);

        // A dependency that already failed settles the newcomer right away.
        if let Some((dependency, status)) = failed_dependency {
            if self.dependency_failure == DependencyFailurePolicy::Cascade {
                self.cancel_pending(&id, Some(dependency_reason(&dependency, status)), now);
            }
        }

        Ok(id)
    }

    /// `{agent}_{task}_{micros}`, bumped by one microsecond until unused.
    fn unique_id(&self, agent_type: &str, task_type: &str, now: DateTime<Utc>) -> TaskId {
        let mut micros = now.timestamp_micros();
        loop {
            let id = TaskId::compose(agent_type, task_type, micros);
            if !self.active.contains_key(&id) && !self.completed.contains_key(&id) {
                return id;
            }
            micros += 1;
        }
    }

    /// Pick the next eligible task, mark it RUNNING and reserve its resources.
    ///
    /// Returns a snapshot for the handler.
    pub fn claim_next(&mut self, now: DateTime<Utc>) -> Option<Task> {
        let active = &self.active;
        let dependencies = &self.dependencies;
        let resources = &self.resources;
        let id = self.queues.pop_first_eligible(self.scan_limit, |id| {
            active.get(id).is_some_and(|task| {
                task.is_due(now) && dependencies.can_execute(task) && resources.can_admit(task)
            })
        })?;

        let task = self.active.get_mut(&id)?;
        self.resources.allocate(task);
        task.start_attempt(now);
        debug!(task_id = %id, attempt = task.retries() + 1, "task claimed");
        Some(task.clone())
    }

    /// Record the outcome of one execution attempt.
    ///
    /// Errors consume the retry budget; `Abandoned` fails the task outright.
    pub fn finish(
        &mut self,
        id: &TaskId,
        outcome: Result<Value, DispatchError>,
        execution_time: f64,
        now: DateTime<Utc>,
    ) -> Option<Settled> {
        let task = self.active.get_mut(id)?;
        if task.status() != TaskStatus::Running {
            warn!(task_id = %id, status = %task.status(), "finish reported for a task that is not running");
            return None;
        }
        self.resources.release(task);

        let error = match outcome {
            Ok(result) => {
                task.mark_completed(result, execution_time, now);
                self.metrics.record_success(execution_time);
                info!(task_id = %id, execution_time, "task completed");
                self.settle(id, TaskStatus::Completed, now);
                return Some(Settled::Completed);
            }
            Err(e) => e,
        };
        if let DispatchError::HandlerPanicked(message) = &error {
            error!(task_id = %id, agent_type = task.agent_type(), panic = %message, "handler panicked");
        }

        let decision = match error {
            DispatchError::Abandoned => RetryDecision::GiveUp,
            _ => self.retry_policy.decide(task.retries(), task.max_retries()),
        };
        match decision {
            RetryDecision::Retry { attempt, delay } => {
                let next_run_at = (!delay.is_zero()).then(|| retry_at(now, delay));
                task.schedule_retry(next_run_at, error.to_string());
                self.metrics.record_retry();
                self.queues.push(task.priority(), id.clone());
                warn!(
                    task_id = %id,
                    attempt,
                    max_retries = task.max_retries(),
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "task failed; retrying"
                );
                Some(Settled::Retrying { attempt })
            }
            RetryDecision::GiveUp => {
                task.mark_failed(error.to_string(), execution_time, now);
                self.metrics.record_failure(execution_time);
                warn!(task_id = %id, retries = task.retries(), error = %error, "task failed");
                self.settle(id, TaskStatus::Failed, now);
                Some(Settled::Failed)
            }
        }
    }

    /// Cancel a task that has not started. Anything else is left alone.
    pub fn cancel(&mut self, id: &TaskId, now: DateTime<Utc>) -> bool {
        let cancelled = self.cancel_pending(id, None, now);
        if cancelled {
            info!(task_id = %id, "task cancelled");
        }
        cancelled
    }

    fn cancel_pending(&mut self, id: &TaskId, reason: Option<String>, now: DateTime<Utc>) -> bool {
        let Some(task) = self.active.get_mut(id) else {
            return false;
        };
        if task.status() != TaskStatus::Pending {
            return false;
        }
        self.queues.remove(task.priority(), id);
        task.mark_cancelled(reason, now);
        self.metrics.record_cancelled();
        self.settle(id, TaskStatus::Cancelled, now);
        true
    }

    /// Move a freshly terminal task to `completed` and propagate its outcome
    /// to dependents.
    fn settle(&mut self, id: &TaskId, status: TaskStatus, now: DateTime<Utc>) {
        let mut pending = vec![(id.clone(), status)];
        while let Some((id, status)) = pending.pop() {
            if let Some(task) = self.active.remove(&id) {
                self.completed.insert(id.clone(), task);
            }
            let waiting = self.dependencies.record_outcome(&id, status);
            if status == TaskStatus::Completed || self.dependency_failure == DependencyFailurePolicy::Block {
                continue;
            }

            let reason = dependency_reason(&id, status);
            for dependent in waiting {
                let Some(task) = self.active.get_mut(&dependent) else {
                    continue;
                };
                if task.status() != TaskStatus::Pending {
                    continue;
                }
                self.queues.remove(task.priority(), &dependent);
                task.mark_cancelled(Some(reason.clone()), now);
                self.metrics.record_cancelled();
                info!(task_id = %dependent, dependency = %id, "dependent cancelled");
                pending.push((dependent, TaskStatus::Cancelled));
            }
        }
    }

    /// Stop accepting submissions.
    pub fn close(&mut self) {
        self.accepting = false;
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.active.get(id).or_else(|| self.completed.get(id)).cloned()
    }

    pub fn running_tasks(&self) -> usize {
        self.active
            .values()
            .filter(|t| t.status() == TaskStatus::Running)
            .count()
    }

    /// Nothing queued and nothing running.
    pub fn is_idle(&self) -> bool {
        self.queues.is_empty() && self.running_tasks() == 0
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        self.metrics.snapshot(
            self.running_tasks(),
            self.queues.depths(),
            self.resources.usage().clone(),
        )
    }
}

/// `now + delay`, saturating at the latest representable instant.
fn retry_at(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn dependency_reason(dependency: &TaskId, status: TaskStatus) -> String {
    match status {
        TaskStatus::Cancelled => format!("dependency {dependency} cancelled"),
        _ => format!("dependency {dependency} failed"),
    }
}
