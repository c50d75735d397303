//! Dependency gate: decides whether a task's prerequisites are satisfied.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (waiting tasks)
//! - Outcomes: terminal status of every finalized task
//! - Invariant: edges and reverse_edges must be kept in sync

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use crate::domain::{Task, TaskId, TaskStatus};

#[derive(Debug, Default)]
pub struct DependencyGate {
    /// Forward edges: task -> tasks it depends on (waits for)
    edges: HashMap<TaskId, HashSet<TaskId>>,

    /// Reverse edges: task -> tasks that depend on it.
    /// Enables O(1) lookup: "who is waiting for this task?"
    reverse_edges: HashMap<TaskId, HashSet<TaskId>>,

    /// Terminal status of finalized tasks.
    outcomes: HashMap<TaskId, TaskStatus>,
}

impl DependencyGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the edges of a newly submitted task.
    pub fn register(&mut self, task: &Task) {
        for dep in task.dependencies() {
            self.add_dependency(task.id().clone(), dep.clone());
        }
    }

    /// `task` waits for `depends_on`. Updates both edge maps.
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.reverse_edges
            .entry(depends_on.clone())
            .or_default()
            .insert(task.clone());
        self.edges.entry(task).or_default().insert(depends_on);
    }

    /// True iff every dependency finished with status COMPLETED.
    pub fn can_execute(&self, task: &Task) -> bool {
        task.dependencies()
            .iter()
            .all(|dep| self.outcomes.get(dep) == Some(&TaskStatus::Completed))
    }

    /// First dependency that ended FAILED or CANCELLED, if any.
    pub fn failed_dependency(&self, task: &Task) -> Option<(TaskId, TaskStatus)> {
        task.dependencies().iter().find_map(|dep| match self.outcomes.get(dep) {
            Some(status @ (TaskStatus::Failed | TaskStatus::Cancelled)) => {
                Some((dep.clone(), *status))
            }
            _ => None,
        })
    }

    /// Record that `task` reached a terminal status.
    ///
    /// Returns the tasks that were waiting on it. The task's own forward
    /// edges are dropped: a finalized task waits for nothing.
    pub fn record_outcome(&mut self, task: &TaskId, status: TaskStatus) -> Vec<TaskId> {
        debug_assert!(status.is_terminal());
        self.outcomes.insert(task.clone(), status);

        for dep in self.get_dependencies(task) {
            self.remove_dependency(task, &dep);
        }
        self.get_waiting_tasks(task)
    }

    /// Remove a single edge from both maps.
    pub fn remove_dependency(&mut self, task: &TaskId, depends_on: &TaskId) {
        if let Entry::Occupied(mut e) = self.edges.entry(task.clone()) {
            e.get_mut().remove(depends_on);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
        if let Entry::Occupied(mut e) = self.reverse_edges.entry(depends_on.clone()) {
            e.get_mut().remove(task);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
    }

    /// Tasks waiting for `task`.
    pub fn get_waiting_tasks(&self, task: &TaskId) -> Vec<TaskId> {
        let mut waiting: Vec<TaskId> = self
            .reverse_edges
            .get(task)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default();
        waiting.sort();
        waiting
    }

    pub fn get_dependencies(&self, task: &TaskId) -> Vec<TaskId> {
        self.edges
            .get(task)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }
}
