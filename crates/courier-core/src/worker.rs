use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::DispatchError;
use crate::runtime::Runtime;
use crate::scheduler::SchedulerState;

/// State shared by the dispatcher facade and every worker.
pub(crate) struct Shared {
    pub state: Mutex<SchedulerState>,
    /// Poked on submit (one worker) and on every finished attempt (all idle workers).
    pub wake: Notify,
    pub runtime: Runtime,
    pub clock: Arc<dyn Clock>,
}

/// Worker pool handle.
/// - `request_shutdown()` で新しい claim を止め、handler に cancel を通知する
/// - `shutdown()` は grace 期間だけ待ち、残りは abandon する
pub(crate) struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    /// Handed to handlers; fires when shutdown starts.
    cancel: CancellationToken,
    /// Fires when the grace period runs out.
    abandon: CancellationToken,
    joins: StdMutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `n` workers.
    pub fn spawn(n: usize, shared: Arc<Shared>, idle_interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let abandon = CancellationToken::new();

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let worker = Worker {
                id: worker_id,
                shared: Arc::clone(&shared),
                shutdown_rx: shutdown_rx.clone(),
                cancel: cancel.clone(),
                abandon: abandon.clone(),
                idle_interval,
            };
            joins.push(tokio::spawn(worker.run()));
        }
        debug!(workers = n, "worker pool started");

        Self {
            shutdown_tx,
            cancel,
            abandon,
            joins: StdMutex::new(joins),
        }
    }

    /// Stop claiming new tasks and signal in-flight handlers.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
        self.cancel.cancel();
    }

    /// Stop waiting for in-flight handlers; their tasks fail as abandoned.
    pub fn abandon(&self) {
        self.abandon.cancel();
    }

    /// Request shutdown, wait up to `grace` for workers, then abandon the rest.
    ///
    /// Only the first call waits; later calls find no workers left to join.
    pub async fn shutdown(&self, grace: Duration) {
        self.request_shutdown();

        let mut joins = std::mem::take(&mut *self.joins.lock().unwrap_or_else(PoisonError::into_inner));
        if joins.is_empty() {
            return;
        }

        let drained = tokio::time::timeout(grace, async {
            while let Some(join) = joins.last_mut() {
                let _ = join.await;
                joins.pop();
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = joins.len(),
                grace_ms = grace.as_millis() as u64,
                "grace period elapsed; abandoning in-flight tasks"
            );
            self.abandon();
            for join in joins {
                let _ = join.await;
            }
        }
        debug!("worker pool stopped");
    }
}

struct Worker {
    id: usize,
    shared: Arc<Shared>,
    shutdown_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
    abandon: CancellationToken,
    idle_interval: Duration,
}

impl Worker {
    async fn run(mut self) {
        loop {
            // shutdown が来ていたら抜ける
            if *self.shutdown_rx.borrow() {
                break;
            }

            // ロックは claim の間だけ
            let claimed = {
                let mut state = self.shared.state.lock().await;
                // lock 待ちの間に shutdown が来ていたら新しい task は取らない
                if *self.shutdown_rx.borrow() || !state.is_accepting() {
                    break;
                }
                state.claim_next(self.shared.clock.now())
            };

            let Some(task) = claimed else {
                // 何もなければ wake / shutdown / interval のどれかまで待つ
                tokio::select! {
                    changed = self.shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = self.shared.wake.notified() => {}
                    _ = tokio::time::sleep(self.idle_interval) => {}
                }
                continue;
            };

            let task_id = task.id().clone();
            debug!(worker_id = self.id, task_id = %task_id, agent_type = task.agent_type(), "executing task");

            // handler 実行はロックの外
            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = self.abandon.cancelled() => Err(DispatchError::Abandoned),
                result = self.shared.runtime.execute(task, self.cancel.child_token()) => result,
            };
            let execution_time = started.elapsed().as_secs_f64();

            {
                let mut state = self.shared.state.lock().await;
                state.finish(&task_id, outcome, execution_time, self.shared.clock.now());
            }
            // 依存解決・リソース解放で他の task が動けるかもしれない
            self.shared.wake.notify_waiters();
        }
        debug!(worker_id = self.id, "worker stopped");
    }
}
