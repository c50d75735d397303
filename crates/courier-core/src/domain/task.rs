//! Task record and the submission request that produces it.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{TaskPriority, TaskStatus};
use crate::error::DispatchError;

/// Metadata key holding `resource name -> quantity`.
pub const REQUIRED_RESOURCES_KEY: &str = "required_resources";

/// Metadata key overriding the configured retry budget.
pub const MAX_RETRIES_KEY: &str = "max_retries";

/// Identifier of a task: `{agent_type}_{task_type}_{timestamp}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Build the id for a task created at `timestamp_micros`.
    pub fn compose(agent_type: &str, task_type: &str, timestamp_micros: i64) -> Self {
        Self(format!("{agent_type}_{task_type}_{timestamp_micros}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// What a caller hands to `Dispatcher::add_task`.
///
/// ```ignore
/// let req = TaskRequest::new("chat", "echo")
///     .with_payload(json!({"x": 1}))
///     .with_priority(TaskPriority::Critical);
/// ```
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub agent_type: String,
    pub task_type: String,
    pub payload: Value,
    pub priority: TaskPriority,
    pub dependencies: Vec<TaskId>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub metadata: Value,
}

impl TaskRequest {
    pub fn new(agent_type: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            task_type: task_type.into(),
            payload: Value::Object(Map::new()),
            priority: TaskPriority::default(),
            dependencies: Vec::new(),
            scheduled_for: None,
            metadata: Value::Object(Map::new()),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies<I>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = TaskId>,
    {
        self.dependencies.extend(dependencies);
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Convenience for `metadata.required_resources[name] = quantity`.
    pub fn require_resource(mut self, name: impl Into<String>, quantity: f64) -> Self {
        if !self.metadata.is_object() {
            self.metadata = Value::Object(Map::new());
        }
        if let Value::Object(meta) = &mut self.metadata {
            let entry = meta
                .entry(REQUIRED_RESOURCES_KEY)
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(resources) = entry {
                resources.insert(name.into(), Value::from(quantity));
            }
        }
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        if !self.metadata.is_object() {
            self.metadata = Value::Object(Map::new());
        }
        if let Value::Object(meta) = &mut self.metadata {
            meta.insert(MAX_RETRIES_KEY.to_string(), Value::from(max_retries));
        }
        self
    }
}

/// A task owned by the dispatcher.
///
/// Callers only ever see clones of this record (see
/// `Dispatcher::get_task_status`). All state transitions happen through the
/// `pub(crate)` methods below, under the scheduler lock.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    id: TaskId,
    agent_type: String,
    task_type: String,
    payload: Map<String, Value>,
    priority: TaskPriority,
    dependencies: Vec<TaskId>,
    created_at: DateTime<Utc>,
    scheduled_for: Option<DateTime<Utc>>,
    metadata: Map<String, Value>,
    #[serde(skip)]
    required_resources: HashMap<String, f64>,

    status: TaskStatus,
    retries: u32,
    max_retries: u32,
    execution_time: Option<f64>,
    result: Option<Value>,
    last_error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Validate a request and turn it into a `Pending` task.
    pub(crate) fn from_request(
        id: TaskId,
        request: TaskRequest,
        created_at: DateTime<Utc>,
        default_max_retries: u32,
    ) -> Result<Self, DispatchError> {
        let payload = match request.payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(DispatchError::InvalidPayload(format!(
                    "payload must be a JSON object, got {other}"
                )));
            }
        };
        let metadata = match request.metadata {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(DispatchError::InvalidMetadata(format!(
                    "metadata must be a JSON object, got {other}"
                )));
            }
        };

        let required_resources = parse_required_resources(&metadata)?;
        let max_retries = match metadata.get(MAX_RETRIES_KEY) {
            None => default_max_retries,
            Some(v) => v
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| {
                    DispatchError::InvalidMetadata(format!(
                        "{MAX_RETRIES_KEY} must be a non-negative integer, got {v}"
                    ))
                })?,
        };

        let mut dependencies: Vec<TaskId> = Vec::with_capacity(request.dependencies.len());
        for dep in request.dependencies {
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }

        Ok(Self {
            id,
            agent_type: request.agent_type,
            task_type: request.task_type,
            payload,
            priority: request.priority,
            dependencies,
            created_at,
            scheduled_for: request.scheduled_for,
            metadata,
            required_resources,
            status: TaskStatus::Pending,
            retries: 0,
            max_retries,
            execution_time: None,
            result: None,
            last_error: None,
            started_at: None,
            finished_at: None,
        })
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    pub fn dependencies(&self) -> &[TaskId] {
        &self.dependencies
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn scheduled_for(&self) -> Option<DateTime<Utc>> {
        self.scheduled_for
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn required_resources(&self) -> &HashMap<String, f64> {
        &self.required_resources
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Seconds spent in the attempt that ended the task.
    pub fn execution_time(&self) -> Option<f64> {
        self.execution_time
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Has the scheduled time been reached?
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.is_none_or(|at| at <= now)
    }

    fn transition(&mut self, next: TaskStatus) {
        debug_assert!(
            self.status.can_transition_to(next),
            "illegal transition {} -> {} for {}",
            self.status,
            next,
            self.id
        );
        self.status = next;
    }

    /// Pending/Retrying -> Running.
    pub(crate) fn start_attempt(&mut self, now: DateTime<Utc>) {
        self.transition(TaskStatus::Running);
        self.started_at = Some(now);
    }

    pub(crate) fn mark_completed(&mut self, result: Value, execution_time: f64, now: DateTime<Utc>) {
        self.transition(TaskStatus::Completed);
        self.result = Some(result);
        self.execution_time = Some(execution_time);
        self.finished_at = Some(now);
    }

    /// Running -> Retrying. The caller has already checked the retry budget.
    pub(crate) fn schedule_retry(&mut self, next_run_at: Option<DateTime<Utc>>, error: String) {
        self.transition(TaskStatus::Retrying);
        self.retries = (self.retries + 1).min(self.max_retries);
        self.scheduled_for = next_run_at.or(self.scheduled_for);
        self.last_error = Some(error);
    }

    pub(crate) fn mark_failed(&mut self, error: String, execution_time: f64, now: DateTime<Utc>) {
        self.transition(TaskStatus::Failed);
        self.last_error = Some(error);
        self.execution_time = Some(execution_time);
        self.finished_at = Some(now);
    }

    pub(crate) fn mark_cancelled(&mut self, reason: Option<String>, now: DateTime<Utc>) {
        self.transition(TaskStatus::Cancelled);
        self.last_error = reason;
        self.finished_at = Some(now);
    }
}

fn parse_required_resources(
    metadata: &Map<String, Value>,
) -> Result<HashMap<String, f64>, DispatchError> {
    let Some(raw) = metadata.get(REQUIRED_RESOURCES_KEY) else {
        return Ok(HashMap::new());
    };
    let Value::Object(entries) = raw else {
        return Err(DispatchError::InvalidMetadata(format!(
            "{REQUIRED_RESOURCES_KEY} must be an object, got {raw}"
        )));
    };

    let mut out = HashMap::with_capacity(entries.len());
    for (name, quantity) in entries {
        match quantity.as_f64() {
            Some(q) if q.is_finite() && q >= 0.0 => {
                out.insert(name.clone(), q);
            }
            _ => {
                return Err(DispatchError::InvalidMetadata(format!(
                    "resource {name} needs a non-negative quantity, got {quantity}"
                )));
            }
        }
    }
    Ok(out)
}
