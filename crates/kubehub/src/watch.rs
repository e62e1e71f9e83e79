//! Watch wiring: kube watchers feeding the store cache and work queues.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::api::{Api, DynamicObject};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use seedling_core::{Kind, ManagedResource, ObjectKey};
use seedling_store::{CacheHandle, Delta, DeltaKind};

use crate::api_resource;

pub(crate) fn dynamic_api(client: Client, kind: Kind, namespace: Option<&str>) -> Api<DynamicObject> {
    let ar = api_resource(kind);
    match namespace {
        Some(ns) if kind.namespaced() => Api::namespaced_with(client, ns, &ar),
        _ => Api::all_with(client, &ar),
    }
}

pub(crate) fn object_key(obj: &DynamicObject) -> ObjectKey {
    ObjectKey::new(obj.namespace().as_deref(), obj.name_any())
}

fn event_keys(ev: watcher::Event<DynamicObject>) -> Vec<ObjectKey> {
    match ev {
        watcher::Event::Applied(o) | watcher::Event::Deleted(o) => vec![object_key(&o)],
        watcher::Event::Restarted(list) => list.iter().map(object_key).collect(),
    }
}

/// Keys touched by a watch on `kind`. Watch errors are retried with backoff and logged.
pub fn watch_keys(client: Client, kind: Kind, namespace: Option<&str>) -> impl Stream<Item = ObjectKey> + Send + 'static {
    let api = dynamic_api(client, kind, namespace);
    info!(kind = %kind, ns = ?namespace, "watch: key stream started");
    watcher::watcher(api, watcher::Config::default())
        .default_backoff()
        .filter_map(move |ev| async move {
            match ev {
                Ok(ev) => Some(futures::stream::iter(event_keys(ev))),
                Err(e) => {
                    warn!(kind = %kind, error = %e, "watch: key stream error");
                    None
                }
            }
        })
        .flatten()
}

pub(crate) struct CacheFeed {
    pub deltas: mpsc::UnboundedSender<Delta>,
    pub cache: CacheHandle,
    pub seq: Arc<AtomicU64>,
    /// Set once, to the last sequence of the first relist.
    pub synced: watch::Sender<Option<u64>>,
}

impl CacheFeed {
    fn send(&self, kind: DeltaKind, object: ManagedResource) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.deltas.send(Delta { seq, kind, object });
    }

    fn convert(kind: Kind, obj: &DynamicObject) -> Option<ManagedResource> {
        let converted = serde_json::to_value(obj)
            .map_err(|e| e.to_string())
            .and_then(|v| ManagedResource::from_object_json(kind, v).map_err(|e| e.to_string()));
        match converted {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(kind = %kind, name = %obj.name_any(), error = %e, "watch: dropping unreadable object");
                None
            }
        }
    }

    /// Fold one watcher event into the cache. A relist also drops cached
    /// objects of the watched scope that are no longer present.
    fn apply(&self, kind: Kind, namespace: Option<&str>, ev: watcher::Event<DynamicObject>) {
        match ev {
            watcher::Event::Applied(o) => {
                if let Some(m) = Self::convert(kind, &o) { self.send(DeltaKind::Applied, m); }
            }
            watcher::Event::Deleted(o) => {
                if let Some(m) = Self::convert(kind, &o) { self.send(DeltaKind::Deleted, m); }
            }
            watcher::Event::Restarted(list) => {
                debug!(kind = %kind, count = list.len(), "watch: relist");
                let listed: BTreeSet<ObjectKey> = list.iter().map(object_key).collect();
                for stale in self.cache.list(kind, namespace).into_iter().filter(|m| !listed.contains(&m.key())) {
                    self.send(DeltaKind::Deleted, stale);
                }
                for o in &list {
                    if let Some(m) = Self::convert(kind, o) { self.send(DeltaKind::Applied, m); }
                }
                let upto = self.seq.load(Ordering::SeqCst);
                let first = self.synced.send_if_modified(|s| match s {
                    None => {
                        *s = Some(upto);
                        true
                    }
                    Some(_) => false,
                });
                if first { info!(kind = %kind, objects = list.len(), "watch: initial list received"); }
            }
        }
        counter!("seedling_watch_events_total", 1u64, "kind" => kind.as_str());
    }
}

/// Spawn a watcher for `kind` that keeps the store cache current.
pub(crate) fn spawn_cache_watch(client: Client, kind: Kind, namespace: Option<String>, feed: CacheFeed) -> JoinHandle<()> {
    tokio::spawn(async move {
        let api = dynamic_api(client, kind, namespace.as_deref());
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        futures::pin_mut!(stream);
        info!(kind = %kind, ns = ?namespace, "watch: cache watcher started");
        while let Some(ev) = stream.next().await {
            match ev {
                Ok(ev) => feed.apply(kind, namespace.as_deref(), ev),
                Err(e) => warn!(kind = %kind, error = %e, "watch: cache watcher error"),
            }
        }
        warn!(kind = %kind, "watch: cache watcher stream ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use seedling_store::spawn_cache_ingest;
    use std::time::Duration;

    fn dynamic(name: &str, ns: &str) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &api_resource(Kind::ConfigMap)).within(ns);
        obj.metadata = ObjectMeta { name: Some(name.into()), namespace: Some(ns.into()), resource_version: Some("7".into()), ..Default::default() };
        obj.data = serde_json::json!({ "data": { "k": "v" } });
        obj
    }

    #[test]
    fn relist_yields_every_key() {
        let keys = event_keys(watcher::Event::Restarted(vec![dynamic("a", "ns"), dynamic("b", "ns")]));
        assert_eq!(keys, vec![ObjectKey::namespaced("ns", "a"), ObjectKey::namespaced("ns", "b")]);
    }

    #[tokio::test]
    async fn relist_drops_objects_that_vanished() {
        let (deltas, cache) = spawn_cache_ingest(Duration::from_millis(2));
        let (synced, mut synced_rx) = watch::channel(None);
        let feed = CacheFeed { deltas, cache: cache.clone(), seq: Arc::new(AtomicU64::new(0)), synced };
        feed.apply(Kind::ConfigMap, Some("ns"), watcher::Event::Applied(dynamic("a", "ns")));
        assert_eq!(*synced_rx.borrow_and_update(), None);
        feed.apply(Kind::ConfigMap, Some("ns"), watcher::Event::Applied(dynamic("b", "ns")));
        cache.wait_for(2).await;
        let a = cache.get(Kind::ConfigMap, &ObjectKey::namespaced("ns", "a")).unwrap();
        assert_eq!(a.field("/data/k"), Some(&serde_json::json!("v")));
        assert_eq!(a.resource_version.as_deref(), Some("7"));

        feed.apply(Kind::ConfigMap, Some("ns"), watcher::Event::Restarted(vec![dynamic("b", "ns")]));
        assert_eq!(*synced_rx.borrow_and_update(), Some(4));
        cache.wait_for(4).await;
        assert!(cache.get(Kind::ConfigMap, &ObjectKey::namespaced("ns", "a")).is_none());
        assert!(cache.get(Kind::ConfigMap, &ObjectKey::namespaced("ns", "b")).is_some());

        // later relists do not move the initial-sync mark
        feed.apply(Kind::ConfigMap, Some("ns"), watcher::Event::Restarted(vec![]));
        assert!(!synced_rx.has_changed().unwrap());
    }
}
