//! Priority queue set: one FIFO ready-queue per priority level.

use std::collections::{HashMap, VecDeque};

use crate::domain::{PriorityOrder, TaskId, TaskPriority};

/// Ready queues, holding `TaskId` only. Task records live in the scheduler
/// state; this structure only decides order.
#[derive(Debug)]
pub struct PriorityQueueSet {
    order: PriorityOrder,
    levels: HashMap<TaskPriority, Level>,
}

/// One priority level.
///
/// `cursor` rotates through the part of the queue past the head window so
/// that entries deeper than `scan_limit` are still reached by later scans.
#[derive(Debug, Default)]
struct Level {
    queue: VecDeque<TaskId>,
    cursor: usize,
}

impl Level {
    /// Index of the entry to take, if any.
    ///
    /// The first `scan_limit` entries are inspected in arrival order. When
    /// none qualifies, up to `scan_limit` more are inspected from the
    /// rotating cursor over the rest of the queue.
    fn find<F>(&mut self, scan_limit: usize, eligible: &mut F) -> Option<usize>
    where
        F: FnMut(&TaskId) -> bool,
    {
        let len = self.queue.len();
        let head = len.min(scan_limit);
        if let Some(index) = self.queue.iter().take(head).position(|id| eligible(id)) {
            return Some(index);
        }

        let tail = len - head;
        if tail == 0 {
            self.cursor = 0;
            return None;
        }
        let start = self.cursor % tail;
        let span = tail.min(scan_limit);
        for step in 0..span {
            let offset = (start + step) % tail;
            if eligible(&self.queue[head + offset]) {
                self.cursor = offset;
                return Some(head + offset);
            }
        }
        self.cursor = (start + span) % tail;
        None
    }
}

impl PriorityQueueSet {
    pub fn new(order: PriorityOrder) -> Self {
        let levels = TaskPriority::ALL
            .into_iter()
            .map(|p| (p, Level::default()))
            .collect();
        Self { order, levels }
    }

    /// Append to the tail of `priority`'s queue.
    pub fn push(&mut self, priority: TaskPriority, task_id: TaskId) {
        self.levels.entry(priority).or_default().queue.push_back(task_id);
    }

    /// Find the first eligible task.
    ///
    /// Levels are scanned in weight order. Within a level at most
    /// `2 * scan_limit` entries are inspected: the head window, then a
    /// rotating window over the rest.
    /// Ineligible entries are skipped, not removed. The returned id is removed.
    pub fn pop_first_eligible<F>(&mut self, scan_limit: usize, mut eligible: F) -> Option<TaskId>
    where
        F: FnMut(&TaskId) -> bool,
    {
        for priority in self.order.levels() {
            let Some(level) = self.levels.get_mut(priority) else {
                continue;
            };
            if let Some(index) = level.find(scan_limit, &mut eligible) {
                return level.queue.remove(index);
            }
        }
        None
    }

    /// Remove `task_id` from `priority`'s queue. Returns whether it was there.
    pub fn remove(&mut self, priority: TaskPriority, task_id: &TaskId) -> bool {
        let Some(level) = self.levels.get_mut(&priority) else {
            return false;
        };
        match level.queue.iter().position(|id| id == task_id) {
            Some(index) => level.queue.remove(index).is_some(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.levels.values().map(|l| l.queue.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.values().all(|l| l.queue.is_empty())
    }

    /// Queue depth per level.
    pub fn depths(&self) -> HashMap<TaskPriority, usize> {
        self.levels.iter().map(|(p, l)| (*p, l.queue.len())).collect()
    }
}
