//! `ResourceStore` over a Kubernetes API server.
//!
//! Reads go through a per-kind watch cache (see `watch_kind`); writes and
//! `fetch` hit the API directly through dynamic `Api<DynamicObject>` handles.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::Client;
use metrics::counter;
use serde_json::Value as Json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use seedling_core::{DeletePropagation, Error, Kind, ManagedResource, ObjectKey, Result};
use seedling_store::{spawn_cache_ingest, CacheHandle, Delta, ResourceStore, Verb};

use crate::map_kube_error;
use crate::watch::{dynamic_api, spawn_cache_watch, CacheFeed};

const CACHE_TICK: Duration = Duration::from_millis(20);

pub struct KubeStore {
    name: String,
    client: Client,
    deltas: mpsc::UnboundedSender<Delta>,
    cache: CacheHandle,
    seq: Arc<AtomicU64>,
    watches: Mutex<BTreeMap<Kind, KindWatch>>,
}

struct KindWatch {
    task: JoinHandle<()>,
    synced: watch::Receiver<Option<u64>>,
}

impl KubeStore {
    /// A store with an empty cache. Call `watch_kind` for every kind read through `get`/`list`.
    pub fn new(name: impl Into<String>, client: Client) -> Self {
        let (deltas, cache) = spawn_cache_ingest(CACHE_TICK);
        Self { name: name.into(), client, deltas, cache, seq: Arc::new(AtomicU64::new(0)), watches: Mutex::new(BTreeMap::new()) }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn client(&self) -> &Client { &self.client }

    /// Start caching `kind`, cluster-wide or within one namespace. Idempotent per kind.
    pub fn watch_kind(&self, kind: Kind, namespace: Option<&str>) {
        let Ok(mut watches) = self.watches.lock() else { return };
        if watches.contains_key(&kind) { return; }
        let (synced_tx, synced) = watch::channel(None);
        let feed = CacheFeed { deltas: self.deltas.clone(), cache: self.cache.clone(), seq: Arc::clone(&self.seq), synced: synced_tx };
        let task = spawn_cache_watch(self.client.clone(), kind, namespace.map(str::to_string), feed);
        watches.insert(kind, KindWatch { task, synced });
        info!(store = %self.name, kind = %kind, ns = ?namespace, "kube store: watching kind");
    }

    /// Wait until the first list of `kind` has been folded into the cache.
    /// Until then a cached miss says nothing about the cluster.
    pub async fn wait_synced(&self, kind: Kind, timeout: Duration) -> Result<()> {
        let mut synced = self
            .watches
            .lock()
            .ok()
            .and_then(|w| w.get(&kind).map(|w| w.synced.clone()))
            .ok_or_else(|| Error::backend(format!("{} cache", self.name), format!("{} is not watched", kind)))?;
        let started = std::time::Instant::now();
        let wait = async {
            let upto = loop {
                if let Some(seq) = *synced.borrow_and_update() { break Some(seq); }
                if synced.changed().await.is_err() { break None; }
            };
            match upto {
                Some(seq) => {
                    self.cache.wait_for(seq).await;
                    Ok(())
                }
                None => Err(Error::backend(format!("{} cache", self.name), format!("{} watch ended before its initial list", kind))),
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::backend(format!("{} cache", self.name), format!("{} not synced after {:?}", kind, timeout)))??;
        info!(store = %self.name, kind = %kind, took_ms = started.elapsed().as_millis() as u64, "kube store: cache synced");
        Ok(())
    }

    fn is_watched(&self, kind: Kind) -> bool {
        self.watches.lock().map(|w| w.contains_key(&kind)).unwrap_or(false)
    }

    fn require_watch(&self, kind: Kind) -> Result<()> {
        if self.is_watched(kind) {
            Ok(())
        } else {
            Err(Error::backend(format!("{} cache", self.name), format!("{} is not watched", kind)))
        }
    }

    fn observe<T>(&self, verb: Verb, kind: Kind, key: &ObjectKey, res: std::result::Result<T, kube::Error>) -> Result<T> {
        let outcome = if res.is_ok() { "ok" } else { "error" };
        counter!("seedling_api_requests_total", 1u64, "verb" => verb.as_str(), "kind" => kind.as_str(), "result" => outcome);
        debug!(store = %self.name, verb = %verb, kind = %kind, key = %key, result = outcome, "kube store: request");
        res.map_err(|e| map_kube_error(kind, key, e))
    }
}

impl Drop for KubeStore {
    fn drop(&mut self) {
        if let Ok(watches) = self.watches.lock() {
            for w in watches.values() { w.task.abort(); }
        }
    }
}

fn to_dynamic(obj: &ManagedResource) -> Result<DynamicObject> {
    Ok(serde_json::from_value(obj.to_object_json())?)
}

fn from_dynamic(kind: Kind, obj: DynamicObject) -> Result<ManagedResource> {
    ManagedResource::from_object_json(kind, serde_json::to_value(obj)?)
}

fn delete_params(propagation: DeletePropagation) -> DeleteParams {
    match propagation {
        DeletePropagation::Foreground => DeleteParams::foreground(),
        DeletePropagation::Background => DeleteParams::background(),
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    fn get(&self, kind: Kind, key: &ObjectKey) -> Result<ManagedResource> {
        self.require_watch(kind)?;
        self.cache.get(kind, key).ok_or_else(|| Error::not_found(kind, key.clone()))
    }

    fn list(&self, kind: Kind, namespace: Option<&str>) -> Result<Vec<ManagedResource>> {
        self.require_watch(kind)?;
        Ok(self.cache.list(kind, namespace))
    }

    async fn fetch(&self, kind: Kind, key: &ObjectKey) -> Result<ManagedResource> {
        let api = dynamic_api(self.client.clone(), kind, key.namespace.as_deref());
        let res = api.get(&key.name).await;
        match res {
            Ok(obj) => from_dynamic(kind, obj),
            Err(e) => Err(map_kube_error(kind, key, e)),
        }
    }

    async fn create(&self, obj: &ManagedResource) -> Result<ManagedResource> {
        let key = obj.key();
        let api = dynamic_api(self.client.clone(), obj.kind, obj.namespace.as_deref());
        let res = api.create(&PostParams::default(), &to_dynamic(obj)?).await;
        from_dynamic(obj.kind, self.observe(Verb::Create, obj.kind, &key, res)?)
    }

    async fn update(&self, obj: &ManagedResource) -> Result<ManagedResource> {
        let key = obj.key();
        let api = dynamic_api(self.client.clone(), obj.kind, obj.namespace.as_deref());
        let res = api.replace(&obj.name, &PostParams::default(), &to_dynamic(obj)?).await;
        from_dynamic(obj.kind, self.observe(Verb::Update, obj.kind, &key, res)?)
    }

    async fn patch(&self, kind: Kind, key: &ObjectKey, patch: &Json) -> Result<ManagedResource> {
        let api = dynamic_api(self.client.clone(), kind, key.namespace.as_deref());
        let res = api.patch(&key.name, &PatchParams::default(), &Patch::Merge(patch)).await;
        from_dynamic(kind, self.observe(Verb::Patch, kind, key, res)?)
    }

    async fn patch_status(&self, kind: Kind, key: &ObjectKey, patch: &Json) -> Result<ManagedResource> {
        let api = dynamic_api(self.client.clone(), kind, key.namespace.as_deref());
        let res = api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(patch)).await;
        from_dynamic(kind, self.observe(Verb::PatchStatus, kind, key, res)?)
    }

    async fn delete(&self, kind: Kind, key: &ObjectKey, propagation: DeletePropagation) -> Result<()> {
        let api = dynamic_api(self.client.clone(), kind, key.namespace.as_deref());
        let res = api.delete(&key.name, &delete_params(propagation)).await;
        self.observe(Verb::Delete, kind, key, res).map(|_| ())
    }
}
