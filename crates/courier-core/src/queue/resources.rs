//! Resource allocator: logical resource accounting for running tasks.

use std::collections::HashMap;

use crate::domain::Task;

/// Below this, float residue left by release() is treated as zero.
const EPSILON: f64 = 1e-9;

/// Tracks how much of each named resource running tasks hold.
///
/// Admission control is advisory: `can_admit` says whether a task fits right
/// now; a task that does not fit is left in its queue and checked again on the
/// next scan.
#[derive(Debug, Clone, Default)]
pub struct ResourceAllocator {
    limits: HashMap<String, f64>,
    usage: HashMap<String, f64>,
}

impl ResourceAllocator {
    pub fn new(limits: HashMap<String, f64>) -> Self {
        Self {
            limits,
            usage: HashMap::new(),
        }
    }

    /// Would `task` fit under every configured limit?
    pub fn can_admit(&self, task: &Task) -> bool {
        task.required_resources().iter().all(|(name, required)| {
            match self.limits.get(name) {
                None => true,
                Some(limit) => self.usage_of(name) + required <= limit + EPSILON,
            }
        })
    }

    /// Can `task` ever fit, even with nothing else running?
    pub fn is_satisfiable(&self, task: &Task) -> bool {
        task.required_resources().iter().all(|(name, required)| {
            self.limits
                .get(name)
                .is_none_or(|limit| *required <= limit + EPSILON)
        })
    }

    pub fn allocate(&mut self, task: &Task) {
        for (name, required) in task.required_resources() {
            *self.usage.entry(name.clone()).or_insert(0.0) += required;
        }
    }

    pub fn release(&mut self, task: &Task) {
        for (name, required) in task.required_resources() {
            if let Some(used) = self.usage.get_mut(name) {
                *used -= required;
                if *used <= EPSILON {
                    self.usage.remove(name);
                }
            }
        }
    }

    pub fn usage_of(&self, name: &str) -> f64 {
        self.usage.get(name).copied().unwrap_or(0.0)
    }

    pub fn usage(&self) -> &HashMap<String, f64> {
        &self.usage
    }
}
