use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::Task;
use crate::error::DispatchError;

/// The external "agent" that executes tasks of one `agent_type`.
///
/// Handlers get a snapshot of the task and a cancellation token that fires
/// when the dispatcher shuts down. They may be invoked more than once for the
/// same task (retries), so side effects must tolerate repetition.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn execute(&self, task: &Task, cancel: CancellationToken) -> Result<Value, DispatchError>;
}

/// Registry of handlers (agent_type -> handler).
///
/// Built during initialization (mutable), then shared read-only by the
/// workers, so lookups need no lock.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn AgentHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for an agent type. Registering twice is an error.
    pub fn register(
        &mut self,
        agent_type: impl Into<String>,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), DispatchError> {
        let agent_type = agent_type.into();
        if self.handlers.contains_key(&agent_type) {
            return Err(DispatchError::DuplicateHandler(agent_type));
        }
        self.handlers.insert(agent_type, handler);
        Ok(())
    }

    pub fn get(&self, agent_type: &str) -> Option<&Arc<dyn AgentHandler>> {
        self.handlers.get(agent_type)
    }

    pub fn agent_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

/// Resolves a task's handler and runs it.
pub struct Runtime {
    registry: Arc<HandlerRegistry>,
}

impl Runtime {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Execute one task.
    ///
    /// The handler runs in its own tokio task so that a panic surfaces as
    /// `HandlerPanicked` instead of unwinding through the worker.
    pub async fn execute(&self, task: Task, cancel: CancellationToken) -> Result<Value, DispatchError> {
        let handler = self
            .registry
            .get(task.agent_type())
            .cloned()
            .ok_or_else(|| DispatchError::HandlerNotFound(task.agent_type().to_string()))?;

        let mut join = AbortOnDrop(tokio::spawn(async move { handler.execute(&task, cancel).await }));
        match (&mut join.0).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(DispatchError::HandlerPanicked(panic_message(e.into_panic()))),
            Err(e) => Err(DispatchError::HandlerPanicked(e.to_string())),
        }
    }
}

/// Aborts the handler task if the worker stops awaiting it (shutdown abandon).
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskId, TaskRequest};
    use chrono::Utc;
    use serde_json::json;

    struct OkHandler;

    #[async_trait]
    impl AgentHandler for OkHandler {
        async fn execute(&self, task: &Task, _cancel: CancellationToken) -> Result<Value, DispatchError> {
            Ok(json!({ "echo": task.payload() }))
        }
    }

    struct PanicHandler;

    #[async_trait]
    impl AgentHandler for PanicHandler {
        async fn execute(&self, _task: &Task, _cancel: CancellationToken) -> Result<Value, DispatchError> {
            panic!("handler blew up");
        }
    }

    fn task(agent_type: &str) -> Task {
        let req = TaskRequest::new(agent_type, "echo").with_payload(json!({"x": 1}));
        Task::from_request(TaskId::new("t"), req, Utc::now(), 0).unwrap()
    }

    #[tokio::test]
    async fn runtime_executes_registered_handler() {
        let mut reg = HandlerRegistry::new();
        reg.register("chat", Arc::new(OkHandler)).unwrap();

        let rt = Runtime::new(Arc::new(reg));
        let out = rt.execute(task("chat"), CancellationToken::new()).await.unwrap();
        assert_eq!(out, json!({"echo": {"x": 1}}));
    }

    #[tokio::test]
    async fn runtime_errors_when_handler_missing() {
        let rt = Runtime::new(Arc::new(HandlerRegistry::new()));

        let err = rt.execute(task("missing"), CancellationToken::new()).await.unwrap_err();
        assert_eq!(err, DispatchError::HandlerNotFound("missing".to_string()));
    }

    #[tokio::test]
    async fn runtime_contains_handler_panics() {
        let mut reg = HandlerRegistry::new();
        reg.register("boom", Arc::new(PanicHandler)).unwrap();

        let rt = Runtime::new(Arc::new(reg));
        let err = rt.execute(task("boom"), CancellationToken::new()).await.unwrap_err();
        assert_eq!(err, DispatchError::HandlerPanicked("handler blew up".to_string()));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut reg = HandlerRegistry::new();
        reg.register("chat", Arc::new(OkHandler)).unwrap();
        let err = reg.register("chat", Arc::new(OkHandler)).unwrap_err();
        assert_eq!(err, DispatchError::DuplicateHandler("chat".to_string()));
        assert_eq!(reg.agent_types(), vec!["chat"]);
    }
}
