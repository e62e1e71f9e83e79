//! Rate-limited work queue keyed by object.
//!
//! A key is queued at most once, handed to at most one worker at a time, and
//! re-queued when it was added again while being processed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use seedling_core::ObjectKey;
use tokio::sync::Notify;
use tracing::trace;

/// Per-key exponential backoff: `base * 2^(failures-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self { Self { base: Duration::from_millis(5), max: Duration::from_secs(1000) } }
}

impl Backoff {
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.base.checked_mul(1u32 << exp).map_or(self.max, |d| d.min(self.max))
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    dirty: FxHashSet<ObjectKey>,
    processing: FxHashSet<ObjectKey>,
    failures: FxHashMap<ObjectKey, u32>,
    /// Last value sent to `seedling_queue_depth`.
    reported_depth: usize,
    shutting_down: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: Backoff,
    name: String,
}

#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>, backoff: Backoff) -> Self {
        let shared = Shared { state: Mutex::new(QueueState::default()), notify: Notify::new(), backoff, name: name.into() };
        Self { shared: Arc::new(shared) }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> { self.shared.state.lock().unwrap_or_else(PoisonError::into_inner) }

    fn report_depth(&self, st: &mut QueueState) {
        st.reported_depth = st.queue.len();
        metrics::gauge!("seedling_queue_depth", st.reported_depth as f64, "queue" => self.shared.name.clone());
    }

    pub fn add(&self, key: ObjectKey) {
        let mut st = self.lock();
        if st.shutting_down || st.dirty.contains(&key) { return; }
        st.dirty.insert(key.clone());
        if st.processing.contains(&key) {
            trace!(queue = %self.shared.name, key = %key, "queue: re-added while processing");
            return;
        }
        st.queue.push_back(key);
        self.report_depth(&mut st);
        drop(st);
        self.shared.notify.notify_one();
    }

    /// Next key to process; `None` once the queue is shut down.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    self.report_depth(&mut st);
                    return Some(key);
                }
                if st.shutting_down { return None; }
            }
            notified.await;
        }
    }

    /// Mark processing finished; a key re-added meanwhile goes back on the queue.
    pub fn done(&self, key: &ObjectKey) {
        let mut st = self.lock();
        st.processing.remove(key);
        if st.dirty.contains(key) {
            st.queue.push_back(key.clone());
            self.report_depth(&mut st);
            drop(st);
            self.shared.notify.notify_one();
        }
    }

    pub fn add_after(&self, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Re-add after this key's backoff delay; every call counts as one more failure.
    pub fn add_rate_limited(&self, key: ObjectKey) -> Duration {
        let failures = {
            let mut st = self.lock();
            let n = st.failures.entry(key.clone()).or_insert(0);
            *n = n.saturating_add(1);
            *n
        };
        let delay = self.shared.backoff.delay(failures);
        self.add_after(key, delay);
        delay
    }

    /// Reset the failure count of a key.
    pub fn forget(&self, key: &ObjectKey) { self.lock().failures.remove(key); }

    pub fn num_requeues(&self, key: &ObjectKey) -> u32 { self.lock().failures.get(key).copied().unwrap_or(0) }

    pub fn len(&self) -> usize { self.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.shared.notify.notify_waiters();
    }
}
