#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use seedling_core::{Kind, ManagedResource, ObjectKey, DeletePropagation, SEED_PROJECT_CLEANUP_FINALIZER};
use seedling_dispatch::{Dispatcher, DispatcherConfig, Reconciler};
use seedling_store::{EventRecorder, FailureRule, MemoryRecorder, MemoryStore, ResourceStore, Verb};
use seedling_sync::{enqueue_all_projects, ProjectSynchronizer, RegistryHandle, SeedRegistry, SeedTopology};
use serde_json::json;
use tokio_util::sync::CancellationToken;

struct Env {
    control: Arc<MemoryStore>,
    seeds: BTreeMap<String, Arc<MemoryStore>>,
    handle: RegistryHandle,
    recorder: Arc<MemoryRecorder>,
    sync: Arc<ProjectSynchronizer>,
}

fn store(name: &str) -> Arc<MemoryStore> { Arc::new(MemoryStore::with_cache_tick(name, Duration::from_millis(2))) }

fn registry(seeds: &BTreeMap<String, Arc<MemoryStore>>) -> SeedRegistry {
    seeds.iter().map(|(n, s)| (n.clone(), s.clone() as Arc<dyn ResourceStore>)).collect()
}

fn env(names: &[&str]) -> Env {
    let control = store("control");
    let seeds: BTreeMap<String, Arc<MemoryStore>> = names.iter().map(|n| (n.to_string(), store(n))).collect();
    let handle = RegistryHandle::new(registry(&seeds));
    let recorder = Arc::new(MemoryRecorder::new());
    let sync = Arc::new(ProjectSynchronizer::new(
        control.clone() as Arc<dyn ResourceStore>,
        handle.clone(),
        recorder.clone() as Arc<dyn EventRecorder>,
    ));
    Env { control, seeds, handle, recorder, sync }
}

impl Env {
    fn seed(&self, name: &str) -> &Arc<MemoryStore> { &self.seeds[name] }

    async fn settle(&self) {
        self.control.settle().await;
        for s in self.seeds.values() { s.settle().await; }
    }

    fn clear_writes(&self) {
        self.control.clear_writes();
        for s in self.seeds.values() { s.clear_writes(); }
    }

    fn seed_verbs(&self, name: &str) -> Vec<Verb> { self.seed(name).writes().into_iter().map(|w| w.verb).collect() }

    async fn reconcile(&self, name: &str) -> seedling_core::Result<seedling_dispatch::Action> {
        self.sync.reconcile(&ObjectKey::cluster(name), CancellationToken::new()).await
    }
}

fn project(name: &str) -> ManagedResource {
    ManagedResource::new(Kind::Project, None, name)
        .with_label("owner", "team-a")
        .with_data("spec", json!({ "name": "Payments" }))
        .with_status(json!({ "phase": "Active", "members": 3 }))
}

#[tokio::test]
async fn active_project_is_replicated_with_status() {
    let e = env(&["seed-a", "seed-b"]);
    e.control.preload(project("p1"));

    e.reconcile("p1").await.unwrap();

    let control = e.control.live(Kind::Project, &ObjectKey::cluster("p1")).unwrap();
    assert!(control.has_finalizer(SEED_PROJECT_CLEANUP_FINALIZER));
    assert_eq!(e.control.writes().iter().map(|w| w.verb).collect::<Vec<_>>(), vec![Verb::Update]);
    for seed in ["seed-a", "seed-b"] {
        let copy = e.seed(seed).live(Kind::Project, &ObjectKey::cluster("p1")).unwrap();
        assert_eq!(copy.field("/spec/name"), Some(&json!("Payments")));
        assert_eq!(copy.labels.get("owner").map(String::as_str), Some("team-a"));
        assert_eq!(copy.status, control.status);
        assert!(!copy.has_finalizer(SEED_PROJECT_CLEANUP_FINALIZER));
        assert_eq!(e.seed_verbs(seed), vec![Verb::Create, Verb::PatchStatus]);
    }
}

#[tokio::test]
async fn converged_project_produces_no_writes() {
    let e = env(&["seed-a", "seed-b"]);
    e.control.preload(project("p1"));
    e.reconcile("p1").await.unwrap();
    e.settle().await;
    e.clear_writes();

    e.reconcile("p1").await.unwrap();
    assert_eq!(e.control.write_count(), 0);
    for s in e.seeds.values() { assert_eq!(s.write_count(), 0); }
}

#[tokio::test]
async fn status_is_mirrored_exactly() {
    let e = env(&["seed-a"]);
    e.control.preload(project("p1"));
    e.reconcile("p1").await.unwrap();
    e.settle().await;

    let key = ObjectKey::cluster("p1");
    e.control.patch_status(Kind::Project, &key, &json!({ "status": { "phase": "Terminating", "members": null } })).await.unwrap();
    e.reconcile("p1").await.unwrap();

    let copy = e.seed("seed-a").live(Kind::Project, &key).unwrap();
    assert_eq!(copy.status, Some(json!({ "phase": "Terminating" })));
}

#[tokio::test]
async fn spec_changes_are_pushed_to_seeds() {
    let e = env(&["seed-a"]);
    e.control.preload(project("p1"));
    e.reconcile("p1").await.unwrap();
    e.settle().await;
    e.clear_writes();

    let key = ObjectKey::cluster("p1");
    e.control.patch(Kind::Project, &key, &json!({ "spec": { "name": "Billing" } })).await.unwrap();
    e.reconcile("p1").await.unwrap();
    assert_eq!(e.seed_verbs("seed-a"), vec![Verb::Update]);
    let copy = e.seed("seed-a").live(Kind::Project, &key).unwrap();
    assert_eq!(copy.field("/spec/name"), Some(&json!("Billing")));
}

#[tokio::test]
async fn partial_failure_names_the_seed_and_retries_cleanly() {
    let e = env(&["seed-a", "seed-b"]);
    e.control.preload(project("p1"));
    e.seed("seed-b").inject_failure(FailureRule::any("seed unreachable").verb(Verb::Create));

    let err = e.reconcile("p1").await.unwrap_err();
    assert_eq!(err.seed(), Some("seed-b"));
    assert!(err.to_string().contains("failed syncing project for seed seed-b"));
    let events = e.recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason, "ReconcilingError");
    assert!(e.seed("seed-a").live(Kind::Project, &ObjectKey::cluster("p1")).is_some());

    e.seed("seed-b").clear_failures();
    e.settle().await;
    e.clear_writes();
    e.reconcile("p1").await.unwrap();
    assert_eq!(e.seed("seed-a").write_count(), 0);
    assert_eq!(e.seed_verbs("seed-b"), vec![Verb::Create, Verb::PatchStatus]);
}

#[tokio::test]
async fn deletion_waits_for_every_seed() {
    let e = env(&["seed-a", "seed-b"]);
    e.control.preload(project("p1"));
    e.reconcile("p1").await.unwrap();
    e.settle().await;

    let key = ObjectKey::cluster("p1");
    e.control.delete(Kind::Project, &key, DeletePropagation::Background).await.unwrap();
    e.seed("seed-b").inject_failure(FailureRule::any("seed unreachable").verb(Verb::Delete));

    let err = e.reconcile("p1").await.unwrap_err();
    assert_eq!(err.seed(), Some("seed-b"));
    let held = e.control.live(Kind::Project, &key).unwrap();
    assert!(held.is_deleting());
    assert!(held.has_finalizer(SEED_PROJECT_CLEANUP_FINALIZER));
    assert!(e.seed("seed-a").live(Kind::Project, &key).is_none());

    // seed-a answers NotFound this time, which counts as done
    e.seed("seed-b").clear_failures();
    e.reconcile("p1").await.unwrap();
    assert!(e.seed("seed-b").live(Kind::Project, &key).is_none());
    assert!(e.control.live(Kind::Project, &key).is_none());
}

#[tokio::test]
async fn deletion_keeps_foreign_finalizers() {
    let e = env(&["seed-a"]);
    let mut p = project("p1");
    p.add_finalizer("example.com/audit");
    p.add_finalizer(SEED_PROJECT_CLEANUP_FINALIZER);
    e.control.preload(p);
    let key = ObjectKey::cluster("p1");
    e.control.delete(Kind::Project, &key, DeletePropagation::Background).await.unwrap();

    e.reconcile("p1").await.unwrap();
    let held = e.control.live(Kind::Project, &key).unwrap();
    assert_eq!(held.finalizers, vec!["example.com/audit".to_string()]);
}

#[tokio::test]
async fn topology_change_only_touches_the_new_seed() {
    let mut e = env(&["seed-a", "seed-b"]);
    e.control.preload(project("p1"));
    e.reconcile("p1").await.unwrap();
    e.settle().await;
    e.clear_writes();

    e.seeds.insert("seed-c".into(), store("seed-c"));
    e.handle.replace(registry(&e.seeds));
    e.reconcile("p1").await.unwrap();

    assert_eq!(e.seed("seed-a").write_count(), 0);
    assert_eq!(e.seed("seed-b").write_count(), 0);
    assert_eq!(e.seed_verbs("seed-c"), vec![Verb::Create, Verb::PatchStatus]);
    assert_eq!(e.control.write_count(), 0);
}

#[tokio::test]
async fn reconnected_seed_with_cold_cache_sees_no_writes() {
    let e = env(&["seed-a"]);
    e.control.preload(project("p1"));
    e.reconcile("p1").await.unwrap();
    e.settle().await;
    e.clear_writes();

    let key = ObjectKey::cluster("p1");
    let copy = e.seed("seed-a").live(Kind::Project, &key).unwrap();
    let cold = Arc::new(MemoryStore::with_cache_tick("seed-a", Duration::from_secs(3600)));
    tokio::time::sleep(Duration::from_millis(10)).await;
    cold.preload(copy);
    assert!(cold.get(Kind::Project, &key).is_err());
    e.handle.replace(SeedRegistry::new().with_seed("seed-a", cold.clone() as Arc<dyn ResourceStore>));

    e.reconcile("p1").await.unwrap();
    assert_eq!(cold.write_count(), 0);
    assert_eq!(e.control.write_count(), 0);
    assert!(e.recorder.events().is_empty());
}

#[tokio::test]
async fn repeated_seed_events_swap_the_registry_once() {
    let e = env(&["seed-a"]);
    e.control.preload(project("p1"));
    e.reconcile("p1").await.unwrap();
    e.settle().await;
    e.clear_writes();

    let desired: SeedTopology = [("seed-a".to_string(), String::new()), ("seed-b".to_string(), "seedling/kc-b@1".to_string())].into();
    let connected = Mutex::new(Vec::<String>::new());
    let before = e.handle.snapshot();
    let mut swaps = 0;
    for _ in 0..3 {
        let swapped = e
            .handle
            .sync_topology(&desired, |name| {
                connected.lock().unwrap().push(name.clone());
                async move { Ok(store(&name) as Arc<dyn ResourceStore>) }
            })
            .await
            .unwrap();
        swaps += usize::from(swapped);
    }
    assert_eq!(swaps, 1);
    assert_eq!(*connected.lock().unwrap(), vec!["seed-b".to_string()]);
    let after = e.handle.snapshot();
    assert!(Arc::ptr_eq(before.get("seed-a").unwrap(), after.get("seed-a").unwrap()));

    e.reconcile("p1").await.unwrap();
    assert_eq!(e.seed("seed-a").write_count(), 0);
    assert!(after.get("seed-b").unwrap().fetch(Kind::Project, &ObjectKey::cluster("p1")).await.is_ok());

    // a rotated kubeconfig reconnects only that seed
    let mut rotated = desired.clone();
    rotated.insert("seed-a".into(), "seedling/kc-a@2".into());
    connected.lock().unwrap().clear();
    let swapped = e
        .handle
        .sync_topology(&rotated, |name| {
            connected.lock().unwrap().push(name.clone());
            async move { Ok(store(&name) as Arc<dyn ResourceStore>) }
        })
        .await
        .unwrap();
    assert!(swapped);
    assert_eq!(*connected.lock().unwrap(), vec!["seed-a".to_string()]);
    assert!(Arc::ptr_eq(after.get("seed-b").unwrap(), e.handle.snapshot().get("seed-b").unwrap()));
}

#[tokio::test]
async fn missing_project_is_ignored() {
    let e = env(&["seed-a"]);
    e.reconcile("ghost").await.unwrap();
    assert_eq!(e.seed("seed-a").write_count(), 0);
    assert_eq!(e.control.write_count(), 0);
}

#[tokio::test]
async fn cancelled_reconcile_leaves_seeds_untouched() {
    let e = env(&["seed-a"]);
    e.control.preload(project("p1"));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = e.sync.reconcile(&ObjectKey::cluster("p1"), cancel).await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(e.seed("seed-a").write_count(), 0);
}

#[tokio::test]
async fn seed_events_enqueue_every_project() {
    let e = env(&["seed-a"]);
    e.control.preload(project("p2"));
    e.control.preload(project("p1"));
    e.settle().await;
    assert_eq!(enqueue_all_projects(e.control.as_ref()), vec![ObjectKey::cluster("p1"), ObjectKey::cluster("p2")]);
}

#[tokio::test]
async fn dispatcher_drives_the_synchronizer() {
    let e = env(&["seed-a", "seed-b"]);
    e.control.preload(project("p1"));
    let d = Dispatcher::new(e.sync.clone(), DispatcherConfig::default());
    let queue = d.queue();
    let stop = CancellationToken::new();
    let run = tokio::spawn(d.run(stop.clone()));

    queue.add(ObjectKey::cluster("p1"));
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let done = e.seeds.values().all(|s| s.live(Kind::Project, &ObjectKey::cluster("p1")).is_some_and(|p| p.status.is_some()));
            if done { break; }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("project was not replicated");
    stop.cancel();
    run.await.unwrap();
}
