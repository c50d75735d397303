use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use courier_core::{
    AgentHandler, CancellationToken, DependencyFailurePolicy, DispatchError, Dispatcher,
    DispatcherConfig, FixedClock, HandlerRegistry, RetryConfig, Task, TaskId, TaskPriority,
    TaskRequest, TaskStatus, async_trait,
};
use serde_json::{Value, json};
use tokio::sync::Notify;

const SETTLE: Duration = Duration::from_secs(5);

fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        max_workers: 2,
        min_batch_interval_ms: 10,
        shutdown_grace_ms: 200,
        retry: RetryConfig {
            base_delay_ms: 10,
            multiplier: 1.0,
            max_delay_ms: 10,
        },
        ..DispatcherConfig::default()
    }
}

fn start(config: DispatcherConfig, handlers: Vec<(&str, Arc<dyn AgentHandler>)>) -> Dispatcher {
    let mut registry = HandlerRegistry::new();
    for (agent_type, handler) in handlers {
        registry.register(agent_type, handler).unwrap();
    }
    Dispatcher::builder()
        .config(config)
        .registry(registry)
        .start()
        .unwrap()
}

/// Sleeps, then appends `payload.name` to a shared log.
struct SleepHandler {
    delay: Duration,
    log: Arc<Mutex<Vec<String>>>,
}

impl SleepHandler {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl AgentHandler for SleepHandler {
    async fn execute(&self, task: &Task, _cancel: CancellationToken) -> Result<Value, DispatchError> {
        tokio::time::sleep(self.delay).await;
        let name = task.payload().get("name").and_then(Value::as_str).unwrap_or("");
        self.log.lock().unwrap().push(name.to_string());
        Ok(json!({ "done": name }))
    }
}

struct AlwaysFails;

#[async_trait]
impl AgentHandler for AlwaysFails {
    async fn execute(&self, _task: &Task, _cancel: CancellationToken) -> Result<Value, DispatchError> {
        Err(DispatchError::handler("nope"))
    }
}

/// Blocks until released, records the peak number of concurrent calls.
struct GateHandler {
    release: Notify,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl GateHandler {
    fn new() -> Self {
        Self {
            release: Notify::new(),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AgentHandler for GateHandler {
    async fn execute(&self, _task: &Task, _cancel: CancellationToken) -> Result<Value, DispatchError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.release.notified().await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(Value::Null)
    }
}

/// Ignores cancellation and never finishes on its own.
struct Stubborn;

#[async_trait]
impl AgentHandler for Stubborn {
    async fn execute(&self, _task: &Task, _cancel: CancellationToken) -> Result<Value, DispatchError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Value::Null)
    }
}

/// Returns as soon as shutdown is signalled.
struct Cooperative;

#[async_trait]
impl AgentHandler for Cooperative {
    async fn execute(&self, _task: &Task, cancel: CancellationToken) -> Result<Value, DispatchError> {
        cancel.cancelled().await;
        Ok(json!("stopped cleanly"))
    }
}

async fn wait_for_status(dispatcher: &Dispatcher, id: &TaskId, status: TaskStatus) {
    let deadline = tokio::time::Instant::now() + SETTLE;
    loop {
        let current = dispatcher.get_task_status(id).await.unwrap().status();
        if current == status {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "{id} stuck in {current}, wanted {status}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// Single-threaded so the workers cannot run before the first status read.
#[tokio::test]
async fn submitted_task_is_pending_then_completes() {
    let dispatcher = start(
        fast_config(),
        vec![("chat", Arc::new(SleepHandler::new(Duration::from_millis(5))))],
    );

    let id = dispatcher
        .add_task(
            TaskRequest::new("chat", "echo")
                .with_payload(json!({"x": 1}))
                .with_priority(TaskPriority::Critical),
        )
        .await
        .unwrap();
    assert_eq!(dispatcher.get_task_status(&id).await.unwrap().status(), TaskStatus::Pending);

    let task = dispatcher.wait_for_task(&id, SETTLE).await.unwrap();
    assert_eq!(task.status(), TaskStatus::Completed);
    assert!(task.execution_time().unwrap() > 0.0);
    assert_eq!(task.result(), Some(&json!({"done": ""})));

    let metrics = dispatcher.get_performance_metrics().await;
    assert_eq!(metrics.total_tasks, 1);
    assert_eq!(metrics.successful_tasks, 1);
    assert!(metrics.avg_execution_time > 0.0);
    dispatcher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dependent_runs_only_after_dependency_completes() {
    let handler = Arc::new(SleepHandler::new(Duration::from_millis(50)));
    let log = Arc::clone(&handler.log);
    let dispatcher = start(fast_config(), vec![("chat", handler)]);

    let a = dispatcher
        .add_task(TaskRequest::new("chat", "a").with_payload(json!({"name": "A"})))
        .await
        .unwrap();
    let b = dispatcher
        .add_task(
            TaskRequest::new("chat", "b")
                .with_payload(json!({"name": "B"}))
                .with_priority(TaskPriority::Critical)
                .with_dependencies([a.clone()]),
        )
        .await
        .unwrap();

    let b_task = dispatcher.wait_for_task(&b, SETTLE).await.unwrap();
    let a_task = dispatcher.get_task_status(&a).await.unwrap();

    assert_eq!(b_task.status(), TaskStatus::Completed);
    assert!(b_task.started_at().unwrap() >= a_task.finished_at().unwrap());
    assert_eq!(*log.lock().unwrap(), vec!["A".to_string(), "B".to_string()]);
    dispatcher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_task_exhausts_retries_then_fails() {
    let dispatcher = start(fast_config(), vec![("chat", Arc::new(AlwaysFails))]);

    let id = dispatcher
        .add_task(TaskRequest::new("chat", "echo").with_max_retries(2))
        .await
        .unwrap();

    let task = dispatcher.wait_for_task(&id, SETTLE).await.unwrap();
    assert_eq!(task.status(), TaskStatus::Failed);
    assert_eq!(task.retries(), 2);
    assert_eq!(task.last_error(), Some("handler failed: nope"));

    let metrics = dispatcher.get_performance_metrics().await;
    assert_eq!(metrics.failed_tasks, 1);
    assert_eq!(metrics.retried_attempts, 2);
    dispatcher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scheduled_task_waits_for_its_time() {
    let start_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let clock = FixedClock::new(start_at);

    let mut registry = HandlerRegistry::new();
    registry
        .register("chat", Arc::new(SleepHandler::new(Duration::from_millis(1))))
        .unwrap();
    let dispatcher = Dispatcher::builder()
        .config(fast_config())
        .registry(registry)
        .clock(Arc::new(clock.clone()))
        .start()
        .unwrap();

    let id = dispatcher
        .add_task(TaskRequest::new("chat", "later").scheduled_for(start_at + chrono::Duration::seconds(2)))
        .await
        .unwrap();

    clock.advance(chrono::Duration::seconds(1));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(dispatcher.get_task_status(&id).await.unwrap().status(), TaskStatus::Pending);

    clock.advance(chrono::Duration::seconds(2));
    let task = dispatcher.wait_for_task(&id, SETTLE).await.unwrap();
    assert_eq!(task.status(), TaskStatus::Completed);
    dispatcher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resource_limit_caps_concurrency() {
    let gate = Arc::new(GateHandler::new());
    let dispatcher = start(
        DispatcherConfig {
            max_workers: 3,
            resource_limits: HashMap::from([("cpu".to_string(), 4.0)]),
            ..fast_config()
        },
        vec![("chat", gate.clone())],
    );

    let mut ids = Vec::new();
    for _ in 0..3 {
        let id = dispatcher
            .add_task(TaskRequest::new("chat", "heavy").require_resource("cpu", 2.0))
            .await
            .unwrap();
        ids.push(id);
    }

    wait_for_status(&dispatcher, &ids[0], TaskStatus::Running).await;
    wait_for_status(&dispatcher, &ids[1], TaskStatus::Running).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(dispatcher.get_task_status(&ids[2]).await.unwrap().status(), TaskStatus::Pending);
    let metrics = dispatcher.get_performance_metrics().await;
    assert_eq!(metrics.running_tasks, 2);
    assert_eq!(metrics.resource_usage["cpu"], 4.0);

    // one release frees room for the third
    gate.release.notify_one();
    wait_for_status(&dispatcher, &ids[2], TaskStatus::Running).await;
    gate.release.notify_one();
    gate.release.notify_one();

    assert!(dispatcher.wait_idle(SETTLE).await);
    assert_eq!(gate.peak.load(Ordering::SeqCst), 2);
    assert!(dispatcher.get_performance_metrics().await.resource_usage.is_empty());
    dispatcher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn higher_priority_runs_first_once_a_worker_frees_up() {
    let gate = Arc::new(GateHandler::new());
    let handler = Arc::new(SleepHandler::new(Duration::from_millis(1)));
    let log = Arc::clone(&handler.log);
    let dispatcher = start(
        DispatcherConfig {
            max_workers: 1,
            ..fast_config()
        },
        vec![("gate", gate.clone()), ("chat", handler)],
    );

    let blocker = dispatcher.add_task(TaskRequest::new("gate", "block")).await.unwrap();
    wait_for_status(&dispatcher, &blocker, TaskStatus::Running).await;

    for (name, priority) in [
        ("low", TaskPriority::Low),
        ("background", TaskPriority::Background),
        ("critical", TaskPriority::Critical),
        ("medium", TaskPriority::Medium),
        ("high", TaskPriority::High),
    ] {
        dispatcher
            .add_task(
                TaskRequest::new("chat", name)
                    .with_priority(priority)
                    .with_payload(json!({ "name": name })),
            )
            .await
            .unwrap();
    }

    gate.release.notify_one();
    assert!(dispatcher.wait_idle(SETTLE).await);
    assert_eq!(*log.lock().unwrap(), vec!["critical", "high", "medium", "low", "background"]);
    dispatcher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_a_pending_task_cascades_to_dependents() {
    let gate = Arc::new(GateHandler::new());
    let dispatcher = start(
        DispatcherConfig {
            max_workers: 1,
            ..fast_config()
        },
        vec![("gate", gate.clone())],
    );

    let running = dispatcher.add_task(TaskRequest::new("gate", "first")).await.unwrap();
    wait_for_status(&dispatcher, &running, TaskStatus::Running).await;

    let a = dispatcher.add_task(TaskRequest::new("gate", "a")).await.unwrap();
    let b = dispatcher
        .add_task(TaskRequest::new("gate", "b").with_dependencies([a.clone()]))
        .await
        .unwrap();

    assert!(!dispatcher.cancel_task(&running).await);
    assert!(dispatcher.cancel_task(&a).await);
    assert!(!dispatcher.cancel_task(&a).await);
    assert!(!dispatcher.cancel_task(&TaskId::new("missing")).await);

    let b = dispatcher.get_task_status(&b).await.unwrap();
    assert_eq!(b.status(), TaskStatus::Cancelled);
    assert_eq!(b.last_error(), Some(format!("dependency {a} cancelled").as_str()));
    assert_eq!(dispatcher.get_task_status(&running).await.unwrap().status(), TaskStatus::Running);

    gate.release.notify_one();
    assert!(dispatcher.wait_idle(SETTLE).await);
    let metrics = dispatcher.get_performance_metrics().await;
    assert_eq!(metrics.cancelled_tasks, 2);
    assert_eq!(metrics.successful_tasks, 1);
    dispatcher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn block_policy_keeps_dependents_pending() {
    let dispatcher = start(
        DispatcherConfig {
            default_max_retries: 0,
            dependency_failure: DependencyFailurePolicy::Block,
            ..fast_config()
        },
        vec![("bad", Arc::new(AlwaysFails))],
    );

    let a = dispatcher.add_task(TaskRequest::new("bad", "a")).await.unwrap();
    let b = dispatcher
        .add_task(TaskRequest::new("bad", "b").with_dependencies([a.clone()]))
        .await
        .unwrap();

    assert_eq!(dispatcher.wait_for_task(&a, SETTLE).await.unwrap().status(), TaskStatus::Failed);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(dispatcher.get_task_status(&b).await.unwrap().status(), TaskStatus::Pending);
    dispatcher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_agent_type_fails_the_task() {
    let dispatcher = start(
        DispatcherConfig {
            default_max_retries: 0,
            ..fast_config()
        },
        vec![],
    );

    let id = dispatcher.add_task(TaskRequest::new("ghost", "x")).await.unwrap();
    let task = dispatcher.wait_for_task(&id, SETTLE).await.unwrap();
    assert_eq!(task.status(), TaskStatus::Failed);
    assert_eq!(task.last_error(), Some("handler not found for agent_type=ghost"));
    dispatcher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submission_errors_are_reported() {
    let dispatcher = start(fast_config(), vec![]);

    let err = dispatcher
        .add_task(TaskRequest::new("chat", "x").with_dependencies([TaskId::new("nope")]))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::UnknownDependency { .. }));

    let err = dispatcher
        .add_task(TaskRequest::new("chat", "x").with_payload(json!([1, 2])))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidPayload(_)));

    let err = dispatcher
        .add_task(TaskRequest::new("chat", "x").with_metadata(json!({"max_retries": -1})))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidMetadata(_)));

    assert_eq!(dispatcher.get_performance_metrics().await.total_tasks, 0);
    dispatcher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_abandons_stubborn_handlers_and_is_idempotent() {
    let dispatcher = start(
        DispatcherConfig {
            max_workers: 1,
            shutdown_grace_ms: 50,
            ..fast_config()
        },
        vec![("slow", Arc::new(Stubborn))],
    );

    let running = dispatcher.add_task(TaskRequest::new("slow", "a")).await.unwrap();
    wait_for_status(&dispatcher, &running, TaskStatus::Running).await;
    let queued = dispatcher.add_task(TaskRequest::new("slow", "b")).await.unwrap();

    dispatcher.shutdown().await;

    let task = dispatcher.get_task_status(&running).await.unwrap();
    assert_eq!(task.status(), TaskStatus::Failed);
    assert_eq!(task.last_error(), Some("abandoned at shutdown"));
    assert_eq!(dispatcher.get_task_status(&queued).await.unwrap().status(), TaskStatus::Pending);

    let before = dispatcher.get_performance_metrics().await;
    assert_eq!(before.failed_tasks, 1);
    assert_eq!(before.running_tasks, 0);

    tokio::time::timeout(Duration::from_millis(100), dispatcher.shutdown())
        .await
        .expect("second shutdown returns immediately");
    assert_eq!(dispatcher.get_performance_metrics().await, before);

    let err = dispatcher.add_task(TaskRequest::new("slow", "c")).await.unwrap_err();
    assert_eq!(err, DispatchError::ShuttingDown);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cooperative_handler_finishes_within_grace() {
    let dispatcher = start(fast_config(), vec![("coop", Arc::new(Cooperative))]);

    let id = dispatcher.add_task(TaskRequest::new("coop", "a")).await.unwrap();
    wait_for_status(&dispatcher, &id, TaskStatus::Running).await;
    dispatcher.shutdown().await;

    let task = dispatcher.get_task_status(&id).await.unwrap();
    assert_eq!(task.status(), TaskStatus::Completed);
    assert_eq!(task.result(), Some(&json!("stopped cleanly")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scoped_dispatcher_shuts_down_after_the_closure() {
    let mut registry = HandlerRegistry::new();
    registry
        .register("chat", Arc::new(SleepHandler::new(Duration::from_millis(1))))
        .unwrap();
    let builder = Dispatcher::builder().config(fast_config()).registry(registry);

    let (dispatcher, id) = Dispatcher::scoped(builder, |d| async move {
        let id = d.add_task(TaskRequest::new("chat", "x")).await.unwrap();
        d.wait_for_task(&id, SETTLE).await;
        (d, id)
    })
    .await
    .unwrap();

    assert_eq!(dispatcher.get_task_status(&id).await.unwrap().status(), TaskStatus::Completed);
    assert_eq!(
        dispatcher.add_task(TaskRequest::new("chat", "late")).await,
        Err(DispatchError::ShuttingDown)
    );
}

#[test]
fn start_outside_a_runtime_is_an_error() {
    let err = Dispatcher::builder().start().err().unwrap();
    assert!(matches!(err, DispatchError::Config(_)));
}
