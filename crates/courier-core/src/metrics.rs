//! Metrics collector: counts and timings, snapshotted under the scheduler lock.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::TaskPriority;

/// Running totals kept inside the scheduler state.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    total_tasks: u64,
    successful_tasks: u64,
    failed_tasks: u64,
    cancelled_tasks: u64,
    retried_attempts: u64,
    /// Number of samples folded into `avg_execution_time`.
    timed_tasks: u64,
    avg_execution_time: f64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&mut self) {
        self.total_tasks += 1;
    }

    pub fn record_success(&mut self, execution_time: f64) {
        self.successful_tasks += 1;
        self.record_execution_time(execution_time);
    }

    pub fn record_failure(&mut self, execution_time: f64) {
        self.failed_tasks += 1;
        self.record_execution_time(execution_time);
    }

    pub fn record_retry(&mut self) {
        self.retried_attempts += 1;
    }

    pub fn record_cancelled(&mut self) {
        self.cancelled_tasks += 1;
    }

    // Incremental mean: new_avg = prev_avg + (x - prev_avg) / n
    fn record_execution_time(&mut self, execution_time: f64) {
        self.timed_tasks += 1;
        let n = self.timed_tasks as f64;
        self.avg_execution_time += (execution_time - self.avg_execution_time) / n;
    }

    /// Combine the counters with live queue/resource figures.
    pub fn snapshot(
        &self,
        running_tasks: usize,
        queued_by_priority: HashMap<TaskPriority, usize>,
        resource_usage: HashMap<String, f64>,
    ) -> PerformanceMetrics {
        PerformanceMetrics {
            total_tasks: self.total_tasks,
            successful_tasks: self.successful_tasks,
            failed_tasks: self.failed_tasks,
            avg_execution_time: self.avg_execution_time,
            cancelled_tasks: self.cancelled_tasks,
            retried_attempts: self.retried_attempts,
            running_tasks,
            queued_by_priority,
            resource_usage,
        }
    }
}

/// Point-in-time view returned by `Dispatcher::get_performance_metrics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    /// Mean seconds over every task that reached COMPLETED or FAILED.
    pub avg_execution_time: f64,
    pub cancelled_tasks: u64,
    pub retried_attempts: u64,
    pub running_tasks: usize,
    pub queued_by_priority: HashMap<TaskPriority, usize>,
    pub resource_usage: HashMap<String, f64>,
}

impl PerformanceMetrics {
    pub fn queued_tasks(&self) -> usize {
        self.queued_by_priority.values().sum()
    }

    /// Tasks that reached a terminal state.
    pub fn finished_tasks(&self) -> u64 {
        self.successful_tasks + self.failed_tasks + self.cancelled_tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_metrics() {
        let m = MetricsCollector::new().snapshot(0, HashMap::new(), HashMap::new());
        assert_eq!(m.total_tasks, 0);
        assert_eq!(m.avg_execution_time, 0.0);
        assert_eq!(m.queued_tasks(), 0);
    }

    #[test]
    fn average_is_the_mean_over_completed_and_failed() {
        let mut m = MetricsCollector::new();
        let samples = [0.1, 0.4, 0.25, 1.0];
        m.record_success(samples[0]);
        m.record_failure(samples[1]);
        m.record_retry();
        m.record_success(samples[2]);
        m.record_cancelled();
        m.record_failure(samples[3]);

        let snap = m.snapshot(1, HashMap::from([(TaskPriority::Low, 2)]), HashMap::new());
        let expected = samples.iter().sum::<f64>() / samples.len() as f64;
        assert!((snap.avg_execution_time - expected).abs() < 1e-12);
        assert_eq!(snap.successful_tasks, 2);
        assert_eq!(snap.failed_tasks, 2);
        assert_eq!(snap.cancelled_tasks, 1);
        assert_eq!(snap.retried_attempts, 1);
        assert_eq!(snap.finished_tasks(), 5);
        assert_eq!(snap.queued_tasks(), 2);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let mut m = MetricsCollector::new();
        m.record_submitted();
        let snap = m.snapshot(0, HashMap::new(), HashMap::from([("cpu".to_string(), 2.0)]));
        let v = serde_json::to_value(&snap).unwrap();
        assert_eq!(v["total_tasks"], 1);
        assert_eq!(v["resource_usage"]["cpu"], 2.0);
    }
}
