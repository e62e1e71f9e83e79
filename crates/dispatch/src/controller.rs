use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use seedling_core::{Error, ObjectKey, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::{Backoff, WorkQueue};

/// Outcome of a successful reconcile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    pub fn done() -> Self { Self { requeue_after: None } }

    pub fn requeue(after: Duration) -> Self { Self { requeue_after: Some(after) } }

    pub fn requeue_after(&self) -> Option<Duration> { self.requeue_after }
}

/// Drives one key towards its desired state.
///
/// `cancel` fires when the reconcile deadline passes or the dispatcher shuts
/// down; long waits must observe it.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    fn name(&self) -> &str;
    async fn reconcile(&self, key: &ObjectKey, cancel: CancellationToken) -> Result<Action>;
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub reconcile_timeout: Duration,
    pub backoff: Backoff,
}

impl Default for DispatcherConfig {
    fn default() -> Self { Self { workers: 4, reconcile_timeout: Duration::from_secs(60), backoff: Backoff::default() } }
}

/// Worker pool draining a `WorkQueue` into a `Reconciler`.
pub struct Dispatcher<R: Reconciler> {
    reconciler: Arc<R>,
    queue: WorkQueue,
    config: DispatcherConfig,
}

impl<R: Reconciler> Dispatcher<R> {
    pub fn new(reconciler: Arc<R>, config: DispatcherConfig) -> Self {
        let queue = WorkQueue::new(reconciler.name().to_string(), config.backoff);
        Self { reconciler, queue, config }
    }

    /// Handle for feeding keys in.
    pub fn queue(&self) -> WorkQueue { self.queue.clone() }

    /// Run workers until `shutdown` fires, then let in-flight reconciles finish.
    pub async fn run(self, shutdown: CancellationToken) {
        let workers = self.config.workers.max(1);
        info!(controller = %self.reconciler.name(), workers, "dispatcher: starting");
        let mut set = JoinSet::new();
        for id in 0..workers {
            let worker = Worker {
                id,
                reconciler: Arc::clone(&self.reconciler),
                queue: self.queue.clone(),
                timeout: self.config.reconcile_timeout,
                shutdown: shutdown.clone(),
            };
            set.spawn(worker.run());
        }
        shutdown.cancelled().await;
        self.queue.shutdown();
        while let Some(res) = set.join_next().await {
            if let Err(e) = res { warn!(error = %e, "dispatcher: worker panicked"); }
        }
        info!(controller = %self.reconciler.name(), "dispatcher: stopped");
    }
}

struct Worker<R: Reconciler> {
    id: usize,
    reconciler: Arc<R>,
    queue: WorkQueue,
    timeout: Duration,
    shutdown: CancellationToken,
}

impl<R: Reconciler> Worker<R> {
    async fn run(self) {
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key);
        }
        debug!(worker = self.id, "dispatcher: worker exiting");
    }

    async fn process(&self, key: &ObjectKey) {
        let name = self.reconciler.name().to_string();
        let token = self.shutdown.child_token();
        let started = Instant::now();
        let res = tokio::select! {
            res = self.reconciler.reconcile(key, token.clone()) => res,
            _ = tokio::time::sleep(self.timeout) => {
                token.cancel();
                Err(Error::cancelled(format!("reconciling {} past its {:?} deadline", key, self.timeout)))
            }
        };
        let took_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("seedling_reconcile_ms", took_ms, "controller" => name.clone());
        match res {
            Ok(action) => {
                metrics::counter!("seedling_reconcile_total", 1u64, "controller" => name.clone(), "result" => "ok");
                self.queue.forget(key);
                match action.requeue_after() {
                    Some(after) => {
                        debug!(controller = %name, key = %key, after_ms = after.as_millis() as u64, took_ms, "reconcile: requeue");
                        self.queue.add_after(key.clone(), after);
                    }
                    None => debug!(controller = %name, key = %key, took_ms, "reconcile: done"),
                }
            }
            Err(e) => {
                metrics::counter!("seedling_reconcile_total", 1u64, "controller" => name.clone(), "result" => "error");
                let delay = self.queue.add_rate_limited(key.clone());
                warn!(controller = %name, key = %key, error = %e, retry_ms = delay.as_millis() as u64, took_ms, "reconcile: failed");
            }
        }
    }
}
