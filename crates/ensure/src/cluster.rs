//! Reconciler for a managed cluster's control-plane components.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use seedling_core::{Error, Kind, ManagedResource, ObjectKey, Result};
use seedling_dispatch::{Action, Reconciler};
use seedling_store::{EventRecorder, ResourceStore};

use crate::ensurer::{count_write, EnsureReport, ResourceEnsurer};
use crate::kinds::{KindEntry, NamedCreator, Stage};
use crate::template::{cluster_namespace, TemplateData, TemplateDataProvider};

/// Delay before recreating objects deleted over an immutable field change.
const RECREATE_AFTER: Duration = Duration::from_secs(1);

/// Supplies the creators of each pipeline stage for one cluster.
pub trait ComponentSet: Send + Sync {
    fn creators(&self, stage: Stage, data: &TemplateData) -> Vec<NamedCreator<TemplateData>>;
}

pub struct ClusterReconciler {
    store: Arc<dyn ResourceStore>,
    ensurer: ResourceEnsurer,
    templates: Arc<dyn TemplateDataProvider>,
    components: Arc<dyn ComponentSet>,
    recorder: Arc<dyn EventRecorder>,
}

impl ClusterReconciler {
    pub fn new(
        ensurer: ResourceEnsurer,
        templates: Arc<dyn TemplateDataProvider>,
        components: Arc<dyn ComponentSet>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        let store = Arc::clone(ensurer.store());
        Self { store, ensurer, templates, components, recorder }
    }

    /// Record `cluster-<name>` as the cluster namespace and create it, owned by the Cluster.
    pub async fn ensure_namespace_exists(&self, cluster: ManagedResource) -> Result<ManagedResource> {
        let cluster = match cluster_namespace(&cluster) {
            Some(_) => cluster,
            None => {
                let ns = format!("cluster-{}", cluster.name);
                let patched = self
                    .store
                    .patch_status(Kind::Cluster, &cluster.key(), &json!({ "status": { "namespaceName": ns } }))
                    .await?;
                count_write(Kind::Cluster, &cluster.name, "patch_status");
                patched
            }
        };
        let ns_name = cluster_namespace(&cluster)
            .ok_or_else(|| Error::backend("ensure namespace", format!("cluster {} still has no namespace", cluster.name)))?
            .to_string();

        let key = ObjectKey::cluster(ns_name.as_str());
        match self.store.get(Kind::Namespace, &key) {
            Ok(_) => return Ok(cluster),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let mut ns = ManagedResource::new(Kind::Namespace, None, ns_name.as_str());
        ns.owner = cluster.owner_reference(true);
        match self.store.create(&ns).await {
            Ok(_) => {
                count_write(Kind::Namespace, &ns_name, "create");
                info!(cluster = %cluster.name, namespace = %ns_name, "cluster: namespace created");
            }
            // the cache had not caught up with an earlier create
            Err(Error::AlreadyExists { .. }) => debug!(namespace = %ns_name, "cluster: namespace already exists"),
            Err(e) => return Err(e),
        }
        Ok(cluster)
    }

    /// Run every pipeline stage in order; stops at the first failing stage.
    pub async fn ensure_resources_are_deployed(&self, data: &TemplateData, cancel: &CancellationToken) -> Result<EnsureReport> {
        let mut report = EnsureReport::default();
        for stage in Stage::PIPELINE {
            let entry = KindEntry { spec: stage.spec(), creators: self.components.creators(stage, data) };
            if entry.creators.is_empty() { continue; }
            report += self.ensurer.ensure_kind(data, Some(data.namespace.as_str()), &entry, cancel).await?;
        }
        Ok(report)
    }

    async fn reconcile_cluster(&self, cluster: ManagedResource, cancel: &CancellationToken) -> Result<EnsureReport> {
        let cluster = self.ensure_namespace_exists(cluster).await?;
        let data = self.templates.template_data(&cluster)?;
        self.ensure_resources_are_deployed(&data, cancel).await
    }
}

#[async_trait]
impl Reconciler for ClusterReconciler {
    fn name(&self) -> &str { "cluster" }

    async fn reconcile(&self, key: &ObjectKey, cancel: CancellationToken) -> Result<Action> {
        let cluster = match self.store.get(Kind::Cluster, key) {
            Ok(c) => c,
            Err(e) if e.is_not_found() => {
                debug!(cluster = %key, "cluster: gone; nothing to do");
                return Ok(Action::done());
            }
            Err(e) => return Err(e),
        };
        if cluster.is_deleting() {
            return Ok(Action::done());
        }
        match self.reconcile_cluster(cluster.clone(), &cancel).await {
            Ok(report) if report.deleted > 0 => Ok(Action::requeue(RECREATE_AFTER)),
            Ok(report) => {
                debug!(cluster = %key, created = report.created, updated = report.updated, patched = report.patched, unchanged = report.unchanged, "cluster: reconciled");
                Ok(Action::done())
            }
            Err(e) => {
                self.recorder.warning(&cluster, "ReconcilingError", &e.to_string()).await;
                Err(e)
            }
        }
    }
}
