//! courier: runs a demo workload through the dispatcher and prints metrics.
//!
//! ```text
//! RUST_LOG=courier_core=debug courier --tasks 40 --fail-every 3
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use courier_core::{
    AgentHandler, DispatchError, Dispatcher, DispatcherConfig, HandlerRegistry, Task, TaskId,
    TaskPriority, TaskRequest,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Submit a mixed workload to an in-process dispatcher.
#[derive(Parser, Debug)]
#[command(name = "courier", version, about)]
struct Cli {
    /// Dispatcher config (TOML). Defaults apply when omitted.
    #[arg(long, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,

    /// Override `max_workers` from the config.
    #[arg(long)]
    workers: Option<usize>,

    /// Number of tasks to submit.
    #[arg(long, default_value_t = 20)]
    tasks: usize,

    /// The flaky handler fails every n-th call (0 = never).
    #[arg(long, default_value_t = 3)]
    fail_every: u64,

    /// Give up waiting for the workload after this many seconds.
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

// ── Handlers ────────────────────────────────────────────────────────

/// Returns the payload unchanged after a short pause.
struct EchoHandler;

#[async_trait]
impl AgentHandler for EchoHandler {
    async fn execute(&self, task: &Task, cancel: CancellationToken) -> Result<Value, DispatchError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(DispatchError::handler("cancelled")),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {
                Ok(json!({ "task_type": task.task_type(), "echo": task.payload() }))
            }
        }
    }
}

/// Fails every `fail_every`-th invocation, so retries are visible.
struct FlakyHandler {
    calls: AtomicU64,
    fail_every: u64,
}

#[async_trait]
impl AgentHandler for FlakyHandler {
    async fn execute(&self, task: &Task, _cancel: CancellationToken) -> Result<Value, DispatchError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if self.fail_every > 0 && call % self.fail_every == 0 {
            return Err(DispatchError::handler(format!(
                "intentional failure on call {call} (retries so far: {})",
                task.retries()
            )));
        }
        Ok(json!({ "call": call }))
    }
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;
    if let Some(workers) = cli.workers {
        config.max_workers = workers;
    }

    let mut registry = HandlerRegistry::new();
    registry.register("echo", Arc::new(EchoHandler))?;
    registry.register(
        "flaky",
        Arc::new(FlakyHandler {
            calls: AtomicU64::new(0),
            fail_every: cli.fail_every,
        }),
    )?;

    let dispatcher = Dispatcher::builder()
        .config(config)
        .registry(registry)
        .start()
        .context("starting dispatcher")?;

    let ids = submit_workload(&dispatcher, cli.tasks).await?;
    info!(submitted = ids.len(), "workload submitted");

    tokio::select! {
        settled = dispatcher.wait_idle(Duration::from_secs(cli.timeout_secs)) => {
            if !settled {
                warn!(timeout_secs = cli.timeout_secs, "workload did not settle in time");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted");
        }
    }

    dispatcher.shutdown().await;

    let metrics = dispatcher.get_performance_metrics().await;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<DispatcherConfig> {
    let Some(path) = path else {
        return Ok(DispatcherConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    DispatcherConfig::from_toml_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

/// Mixed priorities, a dependency chain on every fifth task, cpu
/// requirements on every fourth and a flaky handler on every third.
async fn submit_workload(dispatcher: &Dispatcher, count: usize) -> Result<Vec<TaskId>> {
    let mut ids: Vec<TaskId> = Vec::with_capacity(count);
    for i in 0..count {
        let priority = TaskPriority::ALL[i % TaskPriority::ALL.len()];
        let agent = if i % 3 == 2 { "flaky" } else { "echo" };

        let mut request = TaskRequest::new(agent, "demo")
            .with_priority(priority)
            .with_payload(json!({ "index": i }));
        if i % 5 == 4 {
            if let Some(prev) = ids.last() {
                request = request.with_dependencies([prev.clone()]);
            }
        }
        if i % 4 == 0 {
            request = request.require_resource("cpu", 1.0);
        }

        let id = dispatcher
            .add_task(request)
            .await
            .with_context(|| format!("submitting task {i}"))?;
        ids.push(id);
    }
    Ok(ids)
}
