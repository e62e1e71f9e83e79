use std::future::Future;

use futures::{Stream, StreamExt};
use seedling_core::ObjectKey;
use tracing::debug;

use crate::queue::WorkQueue;

/// Routes watch events into a work queue.
///
/// Primary watches carry the reconciled object's own key; secondary watches
/// carry some other object and are mapped to the primary keys they affect.
#[derive(Clone)]
pub struct EventWatchDispatcher {
    queue: WorkQueue,
}

impl EventWatchDispatcher {
    pub fn new(queue: WorkQueue) -> Self { Self { queue } }

    /// Enqueue every key from a primary watch. Returns the number forwarded when the stream ends.
    pub async fn forward<S>(&self, stream: S) -> usize
    where
        S: Stream<Item = ObjectKey>,
    {
        futures::pin_mut!(stream);
        let mut n = 0usize;
        while let Some(key) = stream.next().await {
            self.queue.add(key);
            n += 1;
        }
        n
    }

    /// Map each secondary event to primary keys and enqueue them.
    pub async fn fan_in<S, T, F, Fut>(&self, stream: S, mapper: F) -> usize
    where
        S: Stream<Item = T>,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Vec<ObjectKey>>,
    {
        futures::pin_mut!(stream);
        let mut n = 0usize;
        while let Some(ev) = stream.next().await {
            let keys = mapper(ev).await;
            debug!(keys = keys.len(), "watch: secondary event fanned in");
            for key in keys {
                self.queue.add(key);
                n += 1;
            }
        }
        n
    }
}
