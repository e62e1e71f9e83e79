#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use seedling_apply::encode_secret_value;
use seedling_core::{Kind, ManagedResource, ObjectKey};
use seedling_dispatch::Reconciler;
use seedling_ensure::{
    ClusterReconciler, ComponentSet, Datacenter, NamedCreator, ResourceEnsurer, Stage, StaticTemplateDataProvider, TemplateData,
    TemplateSettings, WaitConfig,
};
use seedling_store::{EventRecorder, MemoryRecorder, MemoryStore, ResourceStore, Verb};
use serde_json::json;
use tokio_util::sync::CancellationToken;

struct ControlPlane;

fn owned(kind: Kind, data: &TemplateData, name: &str) -> ManagedResource {
    let mut obj = ManagedResource::new(kind, Some(data.namespace.as_str()), name).with_label("cluster", data.cluster.name.as_str());
    obj.owner = data.cluster_owner_ref();
    obj
}

impl ComponentSet for ControlPlane {
    fn creators(&self, stage: Stage, data: &TemplateData) -> Vec<NamedCreator<TemplateData>> {
        match stage {
            Stage::ServiceAccounts => vec![NamedCreator::new("prometheus", |d: &TemplateData, _| Ok(owned(Kind::ServiceAccount, d, "prometheus")))],
            Stage::Services => vec![NamedCreator::new("apiserver", |d: &TemplateData, _| {
                Ok(owned(Kind::Service, d, "apiserver").with_data("spec", json!({ "ports": [{ "port": 443 }] })))
            })],
            Stage::LegacySecrets => ["ca", "admin-kubeconfig"]
                .into_iter()
                .map(|name| {
                    NamedCreator::new(name, move |d: &TemplateData, _| {
                        Ok(owned(Kind::Secret, d, name).with_data("data", json!({ "v": encode_secret_value(name.as_bytes()) })))
                    })
                })
                .collect(),
            Stage::ConfigMaps => vec![NamedCreator::new("cloud-config", |d: &TemplateData, _| {
                Ok(owned(Kind::ConfigMap, d, "cloud-config").with_data("data", json!({ "config": d.datacenter.location })))
            })],
            Stage::Deployments => {
                let mut out = vec![NamedCreator::new("apiserver", |d: &TemplateData, _| {
                    Ok(owned(Kind::Deployment, d, "apiserver").with_data(
                        "spec",
                        json!({ "selector": { "matchLabels": { "app": "apiserver" } }, "image": d.image("gcr.io", "kube-apiserver") }),
                    ))
                })];
                if data.has_machine_networks() {
                    out.push(NamedCreator::new("ipam-controller", |d: &TemplateData, _| {
                        Ok(owned(Kind::Deployment, d, "ipam-controller").with_data("spec", json!({ "selector": { "matchLabels": { "app": "ipam" } } })))
                    }));
                }
                out
            }
            _ => Vec::new(),
        }
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    recorder: Arc<MemoryRecorder>,
    reconciler: ClusterReconciler,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::with_cache_tick("seed", Duration::from_millis(2)));
    let recorder = Arc::new(MemoryRecorder::new());
    let reader = store.clone() as Arc<dyn ResourceStore>;
    let dc = Datacenter { name: "eu-west".into(), location: "Frankfurt".into(), provider: "hetzner".into(), spec: json!({}) };
    let templates = Arc::new(StaticTemplateDataProvider::new([dc], TemplateSettings::default(), reader.clone()));
    let ensurer = ResourceEnsurer::new(reader).with_wait(WaitConfig { timeout: Duration::from_secs(2), interval: Duration::from_millis(5) });
    let reconciler = ClusterReconciler::new(ensurer, templates, Arc::new(ControlPlane), recorder.clone() as Arc<dyn EventRecorder>);
    Fixture { store, recorder, reconciler }
}

fn cluster(dc: &str, machine_networks: bool) -> ManagedResource {
    let nets = if machine_networks { json!([{ "cidr": "192.168.0.0/24" }]) } else { json!([]) };
    ManagedResource::new(Kind::Cluster, None, "abc").with_data("spec", json!({ "cloud": { "dc": dc }, "machineNetworks": nets }))
}

#[tokio::test]
async fn first_pass_bootstraps_namespace_and_components_in_order() {
    let f = fixture();
    let c = f.store.preload(cluster("eu-west", false));
    f.store.settle().await;

    f.reconciler.reconcile(&c.key(), CancellationToken::new()).await.unwrap();

    let live = f.store.live(Kind::Cluster, &c.key()).unwrap();
    assert_eq!(live.status, Some(json!({ "namespaceName": "cluster-abc" })));
    let ns = f.store.live(Kind::Namespace, &ObjectKey::cluster("cluster-abc")).unwrap();
    assert_eq!(ns.owner.as_ref().map(|o| o.uid.clone()), c.uid.clone());

    let created: Vec<(Kind, String)> = f
        .store
        .writes()
        .into_iter()
        .filter(|w| w.verb == Verb::Create)
        .map(|w| (w.kind, w.key.name))
        .collect();
    let expected = vec![
        (Kind::Namespace, "cluster-abc".to_string()),
        (Kind::ServiceAccount, "prometheus".into()),
        (Kind::Service, "apiserver".into()),
        (Kind::Secret, "ca".into()),
        (Kind::Secret, "admin-kubeconfig".into()),
        (Kind::ConfigMap, "cloud-config".into()),
        (Kind::Deployment, "apiserver".into()),
    ];
    assert_eq!(created, expected);
    assert!(f.store.live(Kind::Deployment, &ObjectKey::namespaced("cluster-abc", "ipam-controller")).is_none());
}

#[tokio::test]
async fn converged_cluster_produces_no_writes() {
    let f = fixture();
    let c = f.store.preload(cluster("eu-west", false));
    f.store.settle().await;
    f.reconciler.reconcile(&c.key(), CancellationToken::new()).await.unwrap();
    f.store.settle().await;
    f.store.clear_writes();

    f.reconciler.reconcile(&c.key(), CancellationToken::new()).await.unwrap();
    assert_eq!(f.store.writes(), Vec::new());
}

#[tokio::test]
async fn machine_networks_add_the_ipam_deployment() {
    let f = fixture();
    let c = f.store.preload(cluster("eu-west", true));
    f.store.settle().await;
    f.reconciler.reconcile(&c.key(), CancellationToken::new()).await.unwrap();
    assert!(f.store.live(Kind::Deployment, &ObjectKey::namespaced("cluster-abc", "ipam-controller")).is_some());
}

#[tokio::test]
async fn unknown_datacenter_fails_and_records_an_event() {
    let f = fixture();
    let c = f.store.preload(cluster("nowhere", false));
    f.store.settle().await;

    let err = f.reconciler.reconcile(&c.key(), CancellationToken::new()).await.unwrap_err();
    assert!(err.to_string().contains("failed to get datacenter nowhere"));
    let events = f.recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason, "ReconcilingError");
    assert_eq!(events[0].key, c.key());
}

#[tokio::test]
async fn selector_change_requeues_for_recreation() {
    let f = fixture();
    let c = f.store.preload(cluster("eu-west", false));
    f.store.settle().await;
    f.reconciler.reconcile(&c.key(), CancellationToken::new()).await.unwrap();
    f.store.settle().await;

    let key = ObjectKey::namespaced("cluster-abc", "apiserver");
    f.store.patch(Kind::Deployment, &key, &json!({ "spec": { "selector": { "matchLabels": { "app": "legacy" } } } })).await.unwrap();
    f.store.settle().await;

    let action = f.reconciler.reconcile(&c.key(), CancellationToken::new()).await.unwrap();
    assert!(action.requeue_after().is_some());
    assert!(f.store.live(Kind::Deployment, &key).is_none());
}

#[tokio::test]
async fn missing_cluster_is_a_no_op() {
    let f = fixture();
    let action = f.reconciler.reconcile(&ObjectKey::cluster("gone"), CancellationToken::new()).await.unwrap();
    assert_eq!(action.requeue_after(), None);
    assert_eq!(f.store.write_count(), 0);
}
