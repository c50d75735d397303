//! Dispatcher configuration.
//!
//! Every field has a serde default, so a partial TOML file (or none at all)
//! yields a usable config:
//!
//! ```toml
//! max_workers = 4
//! min_batch_interval_ms = 50
//!
//! [resource_limits]
//! cpu = 4
//!
//! [priority_weights]
//! CRITICAL = 0
//! BACKGROUND = 10
//!
//! [retry]
//! base_delay_ms = 500
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{PriorityOrder, TaskPriority};
use crate::error::DispatchError;
use crate::queue::RetryPolicy;

/// What happens to pending dependents when a dependency ends FAILED or CANCELLED.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyFailurePolicy {
    /// Cancel every pending dependent, transitively.
    #[default]
    Cascade,
    /// Leave dependents pending; they never become eligible.
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_retry_max_delay")]
    pub max_delay_ms: u64,
}

fn default_retry_base_delay() -> u64 { 1000 }
fn default_retry_multiplier() -> f64 { 2.0 }
fn default_retry_max_delay() -> u64 { 60_000 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_retry_base_delay(),
            multiplier: default_retry_multiplier(),
            max_delay_ms: default_retry_max_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Number of workers. 0 = available parallelism.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Queue entries inspected per priority level in one scan.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Idle wait between scans when nothing is eligible.
    #[serde(default = "default_min_batch_interval")]
    pub min_batch_interval_ms: u64,
    /// Resource name -> capacity. Missing = unlimited.
    #[serde(default)]
    pub resource_limits: HashMap<String, f64>,
    /// Priority -> weight. Missing levels keep their default weight.
    #[serde(default)]
    pub priority_weights: HashMap<TaskPriority, u32>,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default)]
    pub retry: RetryConfig,
    /// How long `shutdown()` waits for in-flight handlers.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub dependency_failure: DependencyFailurePolicy,
}

/// Upper bound for `retry.base_delay_ms` and `retry.max_delay_ms` (one week).
const MAX_RETRY_DELAY_MS: u64 = 7 * 24 * 60 * 60 * 1000;

fn default_max_workers() -> usize { 4 }
fn default_batch_size() -> usize { 1024 }
fn default_min_batch_interval() -> u64 { 100 }
fn default_max_retries() -> u32 { 3 }
fn default_shutdown_grace() -> u64 { 5000 }

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            batch_size: default_batch_size(),
            min_batch_interval_ms: default_min_batch_interval(),
            resource_limits: HashMap::new(),
            priority_weights: HashMap::new(),
            default_max_retries: default_max_retries(),
            retry: RetryConfig::default(),
            shutdown_grace_ms: default_shutdown_grace(),
            dependency_failure: DependencyFailurePolicy::default(),
        }
    }
}

impl DispatcherConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, DispatchError> {
        let config: Self = toml::from_str(s).map_err(|e| DispatchError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.batch_size == 0 {
            return Err(DispatchError::Config("batch_size must be at least 1".into()));
        }
        for (name, limit) in &self.resource_limits {
            if !limit.is_finite() || *limit < 0.0 {
                return Err(DispatchError::Config(format!(
                    "resource limit for {name} must be a non-negative number, got {limit}"
                )));
            }
        }
        for (field, value) in [
            ("retry.base_delay_ms", self.retry.base_delay_ms),
            ("retry.max_delay_ms", self.retry.max_delay_ms),
        ] {
            if value > MAX_RETRY_DELAY_MS {
                return Err(DispatchError::Config(format!(
                    "{field} must be at most {MAX_RETRY_DELAY_MS}, got {value}"
                )));
            }
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(DispatchError::Config(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        Ok(())
    }

    /// Resolve worker count (0 means use available parallelism).
    pub fn resolved_max_workers(&self) -> usize {
        if self.max_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.max_workers
        }
    }

    pub fn min_batch_interval(&self) -> Duration {
        Duration::from_millis(self.min_batch_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn priority_order(&self) -> PriorityOrder {
        PriorityOrder::from_weights(&self.priority_weights)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            multiplier: self.retry.multiplier,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }
}
