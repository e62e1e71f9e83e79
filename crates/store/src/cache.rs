//! Cached read side: coalesced deltas folded into ArcSwap snapshots.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use seedling_core::{Kind, ManagedResource, ObjectKey};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

pub type CacheKey = (Kind, ObjectKey);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct Delta {
    /// Store-wide write sequence number.
    pub seq: u64,
    pub kind: DeltaKind,
    pub object: ManagedResource,
}

impl Delta {
    fn cache_key(&self) -> CacheKey { (self.object.kind, self.object.key()) }
}

/// Coalescing queue keyed by object with FIFO order; the latest delta per key wins.
#[derive(Default)]
pub struct Coalescer {
    map: FxHashMap<CacheKey, Delta>,
    order: VecDeque<CacheKey>,
}

impl Coalescer {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    pub fn push(&mut self, d: Delta) {
        let key = d.cache_key();
        if !self.map.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.map.insert(key, d);
    }

    pub fn drain_ready(&mut self) -> Vec<Delta> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&key) {
                out.push(d);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    /// Highest write sequence folded in.
    pub epoch: u64,
    pub items: FxHashMap<CacheKey, ManagedResource>,
}

/// Folds delta batches into cache snapshots.
#[derive(Default)]
pub struct CacheBuilder {
    epoch: u64,
    items: FxHashMap<CacheKey, ManagedResource>,
    seqs: FxHashMap<CacheKey, u64>,
}

impl CacheBuilder {
    pub fn new() -> Self { Self::default() }

    /// Apply a batch; a delta older than what is already cached for its key is ignored.
    pub fn apply(&mut self, batch: Vec<Delta>) {
        for d in batch {
            let key = d.cache_key();
            self.epoch = self.epoch.max(d.seq);
            if self.seqs.get(&key).is_some_and(|seen| *seen >= d.seq) { continue; }
            self.seqs.insert(key.clone(), d.seq);
            match d.kind {
                DeltaKind::Applied => { self.items.insert(key, d.object); }
                DeltaKind::Deleted => { self.items.remove(&key); }
            }
        }
    }

    pub fn freeze(&self) -> Arc<CacheSnapshot> {
        Arc::new(CacheSnapshot { epoch: self.epoch, items: self.items.clone() })
    }
}

/// Read handle for the current snapshot.
#[derive(Clone)]
pub struct CacheHandle {
    snap: Arc<ArcSwap<CacheSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl CacheHandle {
    pub fn current(&self) -> Arc<CacheSnapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    pub fn get(&self, kind: Kind, key: &ObjectKey) -> Option<ManagedResource> {
        self.snap.load().items.get(&(kind, key.clone())).cloned()
    }

    pub fn list(&self, kind: Kind, namespace: Option<&str>) -> Vec<ManagedResource> {
        let snap = self.snap.load();
        let mut out: Vec<ManagedResource> = snap
            .items
            .iter()
            .filter(|((k, key), _)| *k == kind && (namespace.is_none() || key.namespace.as_deref() == namespace))
            .map(|(_, obj)| obj.clone())
            .collect();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        out
    }

    /// Wait until the snapshot has folded in every write up to `seq`.
    pub async fn wait_for(&self, seq: u64) {
        let mut rx = self.subscribe_epoch();
        while *rx.borrow_and_update() < seq {
            if rx.changed().await.is_err() { break; }
        }
    }
}

/// Spawn the ingest loop. Deltas are coalesced and published every `tick`,
/// so reads lag writes by up to one tick the way an informer cache does.
pub fn spawn_cache_ingest(tick: Duration) -> (mpsc::UnboundedSender<Delta>, CacheHandle) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Delta>();
    let snap = Arc::new(ArcSwap::from_pointee(CacheSnapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let snap_clone = Arc::clone(&snap);

    tokio::spawn(async move {
        let mut coalescer = Coalescer::new();
        let mut builder = CacheBuilder::new();
        let mut ticker = tokio::time::interval(tick);
        let mut publish = |coalescer: &mut Coalescer, builder: &mut CacheBuilder| {
            let batch = coalescer.drain_ready();
            if !batch.is_empty() {
                builder.apply(batch);
                let next = builder.freeze();
                let epoch = next.epoch;
                snap_clone.store(next);
                let _ = epoch_tx.send(epoch);
            }
        };
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(d) => coalescer.push(d),
                        None => {
                            debug!("delta channel closed; draining and exiting cache ingest");
                            publish(&mut coalescer, &mut builder);
                            break;
                        }
                    }
                }
                _ = ticker.tick() => publish(&mut coalescer, &mut builder),
            }
        }
        info!("cache ingest loop stopped");
    });

    (tx, CacheHandle { snap, epoch_rx })
}
