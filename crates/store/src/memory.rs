//! In-memory `ResourceStore`.
//!
//! Writes land in a live map and publish deltas to the cache ingest loop, so
//! cached reads trail writes the way an informer does. Every write attempt is
//! logged and can be made to fail.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use seedling_apply::apply_merge_patch;
use seedling_core::{DeletePropagation, Error, Kind, ManagedResource, ObjectKey, Result};

use crate::cache::{spawn_cache_ingest, CacheHandle, CacheKey, Delta, DeltaKind};
use crate::{ResourceStore, Verb};

const DEFAULT_CACHE_TICK: Duration = Duration::from_millis(8);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub verb: Verb,
    pub kind: Kind,
    pub key: ObjectKey,
    pub propagation: Option<DeletePropagation>,
}

/// Makes matching write attempts fail with a backend error.
#[derive(Debug, Clone)]
pub struct FailureRule {
    pub verb: Option<Verb>,
    pub kind: Option<Kind>,
    pub name: Option<String>,
    pub message: String,
}

impl FailureRule {
    /// Fail every write.
    pub fn any(message: impl Into<String>) -> Self {
        Self { verb: None, kind: None, name: None, message: message.into() }
    }

    pub fn verb(mut self, verb: Verb) -> Self {
        self.verb = Some(verb);
        self
    }

    pub fn kind(mut self, kind: Kind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn matches(&self, verb: Verb, kind: Kind, key: &ObjectKey) -> bool {
        self.verb.map_or(true, |v| v == verb)
            && self.kind.map_or(true, |k| k == kind)
            && self.name.as_deref().map_or(true, |n| n == key.name)
    }
}

#[derive(Default)]
struct LiveState {
    objects: BTreeMap<CacheKey, ManagedResource>,
    seq: u64,
    writes: Vec<WriteRecord>,
    failures: Vec<FailureRule>,
}

pub struct MemoryStore {
    name: String,
    state: Mutex<LiveState>,
    deltas: mpsc::UnboundedSender<Delta>,
    cache: CacheHandle,
}

impl MemoryStore {
    /// Must be called inside a tokio runtime; spawns the cache ingest loop.
    pub fn new(name: impl Into<String>) -> Self { Self::with_cache_tick(name, DEFAULT_CACHE_TICK) }

    pub fn with_cache_tick(name: impl Into<String>, tick: Duration) -> Self {
        let (deltas, cache) = spawn_cache_ingest(tick);
        Self { name: name.into(), state: Mutex::new(LiveState::default()), deltas, cache }
    }

    pub fn name(&self) -> &str { &self.name }

    /// Insert an object directly, without logging a write.
    pub fn preload(&self, obj: ManagedResource) -> ManagedResource {
        let mut st = self.lock();
        let mut obj = obj;
        st.seq += 1;
        obj.resource_version = Some(st.seq.to_string());
        if obj.uid.is_none() { obj.uid = Some(uuid::Uuid::new_v4().to_string()); }
        self.publish(&mut st, DeltaKind::Applied, obj.clone());
        obj
    }

    /// Wait until the cache reflects every write made so far.
    pub async fn settle(&self) {
        let target = self.lock().seq;
        self.cache.wait_for(target).await;
    }

    pub fn writes(&self) -> Vec<WriteRecord> { self.lock().writes.clone() }

    pub fn write_count(&self) -> usize { self.lock().writes.len() }

    pub fn clear_writes(&self) { self.lock().writes.clear(); }

    pub fn inject_failure(&self, rule: FailureRule) { self.lock().failures.push(rule); }

    pub fn clear_failures(&self) { self.lock().failures.clear(); }

    /// Live view of an object, for assertions.
    pub fn live(&self, kind: Kind, key: &ObjectKey) -> Option<ManagedResource> {
        self.lock().objects.get(&(kind, key.clone())).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, LiveState> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Log the attempt and apply failure rules.
    fn begin(&self, st: &mut LiveState, verb: Verb, kind: Kind, key: &ObjectKey, propagation: Option<DeletePropagation>) -> Result<()> {
        st.writes.push(WriteRecord { verb, kind, key: key.clone(), propagation });
        if let Some(rule) = st.failures.iter().find(|r| r.matches(verb, kind, key)) {
            debug!(store = %self.name, verb = %verb, kind = %kind, key = %key, "memory store: injected failure");
            return Err(Error::backend(format!("{} {} {}", self.name, verb, kind), rule.message.clone()));
        }
        Ok(())
    }

    fn publish(&self, st: &mut LiveState, kind: DeltaKind, obj: ManagedResource) {
        let key = (obj.kind, obj.key());
        match kind {
            DeltaKind::Applied => { st.objects.insert(key, obj.clone()); }
            DeltaKind::Deleted => { st.objects.remove(&key); }
        }
        let seq = st.seq;
        if self.deltas.send(Delta { seq, kind, object: obj }).is_err() {
            warn!(store = %self.name, "memory store: cache ingest stopped");
        }
    }

    /// Store a modified object, bumping its resourceVersion. A deleting
    /// object whose last finalizer is gone is removed instead.
    fn commit(&self, st: &mut LiveState, mut obj: ManagedResource) -> ManagedResource {
        st.seq += 1;
        obj.resource_version = Some(st.seq.to_string());
        if obj.is_deleting() && obj.finalizers.is_empty() {
            self.remove(st, obj.clone());
        } else {
            self.publish(st, DeltaKind::Applied, obj.clone());
        }
        obj
    }

    /// Remove an object and garbage-collect everything it owns.
    fn remove(&self, st: &mut LiveState, obj: ManagedResource) {
        let uid = obj.uid.clone();
        self.publish(st, DeltaKind::Deleted, obj);
        let Some(uid) = uid else { return };
        let owned: Vec<ManagedResource> = st
            .objects
            .values()
            .filter(|o| o.owner.as_ref().is_some_and(|r| r.uid == uid))
            .cloned()
            .collect();
        for child in owned {
            st.seq += 1;
            if child.finalizers.is_empty() {
                self.remove(st, child);
            } else if !child.is_deleting() {
                let mut child = child;
                child.deletion_timestamp = Some(Utc::now().trunc_subsecs(0));
                child.resource_version = Some(st.seq.to_string());
                self.publish(st, DeltaKind::Applied, child);
            }
        }
    }

    fn existing(st: &LiveState, kind: Kind, key: &ObjectKey) -> Result<ManagedResource> {
        st.objects.get(&(kind, key.clone())).cloned().ok_or_else(|| Error::not_found(kind, key.clone()))
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    fn get(&self, kind: Kind, key: &ObjectKey) -> Result<ManagedResource> {
        self.cache.get(kind, key).ok_or_else(|| Error::not_found(kind, key.clone()))
    }

    fn list(&self, kind: Kind, namespace: Option<&str>) -> Result<Vec<ManagedResource>> {
        Ok(self.cache.list(kind, namespace))
    }

    async fn fetch(&self, kind: Kind, key: &ObjectKey) -> Result<ManagedResource> {
        Self::existing(&self.lock(), kind, key)
    }

    async fn create(&self, obj: &ManagedResource) -> Result<ManagedResource> {
        let key = obj.key();
        let mut st = self.lock();
        self.begin(&mut st, Verb::Create, obj.kind, &key, None)?;
        if obj.kind.namespaced() != obj.namespace.is_some() {
            return Err(Error::Rejected { kind: obj.kind, key, message: "namespace does not match kind scope".into() });
        }
        if st.objects.contains_key(&(obj.kind, key.clone())) {
            return Err(Error::AlreadyExists { kind: obj.kind, key });
        }
        let mut obj = obj.clone();
        obj.uid = Some(uuid::Uuid::new_v4().to_string());
        obj.deletion_timestamp = None;
        obj.status = None;
        Ok(self.commit(&mut st, obj))
    }

    async fn update(&self, obj: &ManagedResource) -> Result<ManagedResource> {
        let key = obj.key();
        let mut st = self.lock();
        self.begin(&mut st, Verb::Update, obj.kind, &key, None)?;
        let live = Self::existing(&st, obj.kind, &key)?;
        if obj.resource_version.is_some() && obj.resource_version != live.resource_version {
            return Err(Error::Conflict {
                kind: obj.kind,
                key,
                message: format!("resourceVersion {:?} is stale, live is {:?}", obj.resource_version, live.resource_version),
            });
        }
        let mut next = obj.clone();
        next.uid = live.uid;
        next.deletion_timestamp = live.deletion_timestamp;
        next.status = live.status;
        Ok(self.commit(&mut st, next))
    }

    async fn patch(&self, kind: Kind, key: &ObjectKey, patch: &Json) -> Result<ManagedResource> {
        let mut st = self.lock();
        self.begin(&mut st, Verb::Patch, kind, key, None)?;
        let live = Self::existing(&st, kind, key)?;
        let merged = apply_merge_patch(&live.to_object_json(), patch);
        let mut next = ManagedResource::from_object_json(kind, merged)?;
        if next.key() != *key {
            return Err(Error::Rejected { kind, key: key.clone(), message: "patch may not change name or namespace".into() });
        }
        next.uid = live.uid;
        next.deletion_timestamp = live.deletion_timestamp;
        next.status = live.status;
        Ok(self.commit(&mut st, next))
    }

    async fn patch_status(&self, kind: Kind, key: &ObjectKey, patch: &Json) -> Result<ManagedResource> {
        let mut st = self.lock();
        self.begin(&mut st, Verb::PatchStatus, kind, key, None)?;
        let mut next = Self::existing(&st, kind, key)?;
        let merged = apply_merge_patch(&next.to_object_json(), patch);
        next.status = merged.get("status").filter(|s| !s.is_null()).cloned();
        Ok(self.commit(&mut st, next))
    }

    async fn delete(&self, kind: Kind, key: &ObjectKey, propagation: DeletePropagation) -> Result<()> {
        let mut st = self.lock();
        self.begin(&mut st, Verb::Delete, kind, key, Some(propagation))?;
        let mut live = Self::existing(&st, kind, key)?;
        if live.finalizers.is_empty() {
            st.seq += 1;
            self.remove(&mut st, live);
        } else if !live.is_deleting() {
            live.deletion_timestamp = Some(Utc::now().trunc_subsecs(0));
            self.commit(&mut st, live);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(name: &str) -> ManagedResource {
        ManagedResource::new(Kind::ConfigMap, Some("ns"), name).with_data("data", json!({ "k": "v" }))
    }

    #[tokio::test]
    async fn cache_trails_live_writes_until_settled() {
        let store = MemoryStore::with_cache_tick("seed", Duration::from_millis(50));
        let created = store.create(&cm("a")).await.unwrap();
        assert!(created.uid.is_some());
        assert!(store.fetch(Kind::ConfigMap, &created.key()).await.is_ok());
        store.settle().await;
        let cached = store.get(Kind::ConfigMap, &created.key()).unwrap();
        assert_eq!(cached.resource_version, created.resource_version);
        assert_eq!(store.list(Kind::ConfigMap, Some("ns")).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_conflicts_and_stale_updates_are_rejected() {
        let store = MemoryStore::new("seed");
        let a = store.create(&cm("a")).await.unwrap();
        assert!(matches!(store.create(&cm("a")).await, Err(Error::AlreadyExists { .. })));
        let mut stale = a.clone();
        stale.resource_version = Some("0".into());
        assert!(matches!(store.update(&stale).await, Err(Error::Conflict { .. })));
        let updated = store.update(&a.clone().with_label("x", "y")).await.unwrap();
        assert_eq!(updated.uid, a.uid);
        assert!(store.update(&cm("missing")).await.unwrap_err().is_not_found());
        let wrong_scope = ManagedResource::new(Kind::Project, Some("ns"), "p");
        assert!(matches!(store.create(&wrong_scope).await, Err(Error::Rejected { .. })));
    }

    #[tokio::test]
    async fn finalizers_hold_deletion_until_removed() {
        let store = MemoryStore::new("seed");
        let mut p = ManagedResource::new(Kind::Project, None, "p");
        p.add_finalizer("seedling.io/cleanup-seed-project");
        let p = store.create(&p).await.unwrap();
        store.delete(Kind::Project, &p.key(), DeletePropagation::Background).await.unwrap();
        let deleting = store.fetch(Kind::Project, &p.key()).await.unwrap();
        assert!(deleting.is_deleting());
        store.patch(Kind::Project, &p.key(), &json!({ "metadata": { "finalizers": null } })).await.unwrap();
        assert!(store.fetch(Kind::Project, &p.key()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn deleting_an_owner_collects_dependents() {
        let store = MemoryStore::new("seed");
        let cluster = store.create(&ManagedResource::new(Kind::Cluster, None, "c1")).await.unwrap();
        let mut ns = ManagedResource::new(Kind::Namespace, None, "cluster-c1");
        ns.owner = cluster.owner_reference(true);
        store.create(&ns).await.unwrap();
        store.delete(Kind::Cluster, &cluster.key(), DeletePropagation::Foreground).await.unwrap();
        assert!(store.live(Kind::Namespace, &ObjectKey::cluster("cluster-c1")).is_none());
        let last = store.writes().pop().unwrap();
        assert_eq!(last.propagation, Some(DeletePropagation::Foreground));
    }

    #[tokio::test]
    async fn status_is_only_written_through_the_subresource() {
        let store = MemoryStore::new("seed");
        let p = store.create(&ManagedResource::new(Kind::Project, None, "p").with_status(json!({ "phase": "x" }))).await.unwrap();
        assert_eq!(p.status, None);
        let p = store.patch_status(Kind::Project, &p.key(), &json!({ "status": { "phase": "Active" } })).await.unwrap();
        assert_eq!(p.status, Some(json!({ "phase": "Active" })));
        let p = store.update(&p.clone().with_status(json!({ "phase": "Other" }))).await.unwrap();
        assert_eq!(p.status, Some(json!({ "phase": "Active" })));
    }

    #[tokio::test]
    async fn injected_failures_match_and_are_logged() {
        let store = MemoryStore::new("seed");
        store.inject_failure(FailureRule::any("boom").verb(Verb::Create).name("b"));
        assert!(store.create(&cm("a")).await.is_ok());
        let err = store.create(&cm("b")).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(store.write_count(), 2);
        store.clear_failures();
        store.clear_writes();
        assert!(store.create(&cm("b")).await.is_ok());
        assert_eq!(store.writes()[0].verb, Verb::Create);
    }
}
