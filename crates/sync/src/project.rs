//! Replicates Projects from the control plane to every seed and gates their
//! deletion on cleanup everywhere.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as Json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use seedling_apply::create_merge_patch;
use seedling_core::{ignore_not_found, DeletePropagation, Error, Kind, ManagedResource, ObjectKey, Result, SEED_PROJECT_CLEANUP_FINALIZER};
use seedling_dispatch::{Action, Reconciler};
use seedling_ensure::{count_write, KindEntry, KindSpec, ResourceEnsurer, WaitConfig};
use seedling_store::{EventRecorder, ResourceStore};

use crate::registry::{RegistryHandle, SeedRegistry};

pub const CONTROLLER_NAME: &str = "project-sync-controller";

/// Desired seed copy: the control-plane Project's labels and payload.
/// Status is mirrored separately through the status subresource.
pub fn seed_project(control: &ManagedResource, existing: Option<ManagedResource>) -> Result<ManagedResource> {
    let mut p = existing.unwrap_or_else(|| ManagedResource::new(Kind::Project, None, control.name.as_str()));
    p.labels = control.labels.clone();
    p.data = control.data.clone();
    Ok(p)
}

pub struct ProjectSynchronizer {
    control: Arc<dyn ResourceStore>,
    registry: RegistryHandle,
    recorder: Arc<dyn EventRecorder>,
    wait: WaitConfig,
}

impl ProjectSynchronizer {
    pub fn new(control: Arc<dyn ResourceStore>, registry: RegistryHandle, recorder: Arc<dyn EventRecorder>) -> Self {
        Self { control, registry, recorder, wait: WaitConfig::default() }
    }

    pub fn with_wait(mut self, wait: WaitConfig) -> Self {
        self.wait = wait;
        self
    }

    async fn reconcile_active(&self, project: &ManagedResource, seeds: &SeedRegistry, cancel: &CancellationToken) -> Result<()> {
        let entry = KindEntry::<ManagedResource>::new(KindSpec::structural(Kind::Project)).with(project.name.as_str(), seed_project);
        for (seed, store) in seeds.iter() {
            if cancel.is_cancelled() {
                return Err(Error::cancelled(format!("syncing project {}", project.name)));
            }
            self.sync_seed(project, &entry, store, cancel).await.map_err(|e| e.for_seed(seed))?;
            debug!(project = %project.name, seed, "project: reconciled with seed");
        }
        Ok(())
    }

    async fn sync_seed(
        &self,
        project: &ManagedResource,
        entry: &KindEntry<ManagedResource>,
        store: &Arc<dyn ResourceStore>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let ensurer = ResourceEnsurer::new(Arc::clone(store)).with_wait(self.wait);
        ensurer.ensure_kind(project, None, entry, cancel).await?;
        let seed_copy = store.fetch(Kind::Project, &project.key()).await?;
        if seed_copy.status != project.status {
            let from = seed_copy.status.clone().unwrap_or(Json::Null);
            let to = project.status.clone().unwrap_or(Json::Null);
            let patch = json!({ "status": create_merge_patch(&from, &to) });
            store.patch_status(Kind::Project, &project.key(), &patch).await?;
            count_write(Kind::Project, &project.name, "patch_status");
        }
        Ok(())
    }

    /// Remove the copy from every seed, then release the finalizer. Returns
    /// whether this call released it.
    async fn handle_deletion(&self, project: &ManagedResource, seeds: &SeedRegistry) -> Result<bool> {
        for (seed, store) in seeds.iter() {
            ignore_not_found(store.delete(Kind::Project, &project.key(), DeletePropagation::Background).await)
                .map_err(|e| e.for_seed(seed))?;
            debug!(project = %project.name, seed, "project: deleted from seed");
        }
        if !project.has_finalizer(SEED_PROJECT_CLEANUP_FINALIZER) {
            return Ok(false);
        }
        let mut remaining = project.clone();
        remaining.remove_finalizer(SEED_PROJECT_CLEANUP_FINALIZER);
        let finalizers = if remaining.finalizers.is_empty() { Json::Null } else { json!(remaining.finalizers) };
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        match self.control.patch(Kind::Project, &project.key(), &patch).await {
            Ok(_) => {
                count_write(Kind::Project, &project.name, "patch");
                info!(project = %project.name, "project: cleanup finalizer removed");
                Ok(true)
            }
            // a shared control/seed cluster may already have dropped it above
            Err(e) if e.is_not_found() => {
                debug!(project = %project.name, "project: gone before finalizer removal");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Reconciler for ProjectSynchronizer {
    fn name(&self) -> &str { CONTROLLER_NAME }

    async fn reconcile(&self, key: &ObjectKey, cancel: CancellationToken) -> Result<Action> {
        let mut project = match self.control.fetch(Kind::Project, key).await {
            Ok(p) => p,
            Err(e) if e.is_not_found() => return Ok(Action::done()),
            Err(e) => return Err(e),
        };
        let seeds = self.registry.snapshot();

        if project.is_deleting() {
            self.handle_deletion(&project, &seeds).await?;
            return Ok(Action::done());
        }

        if project.add_finalizer(SEED_PROJECT_CLEANUP_FINALIZER) {
            project = self.control.update(&project).await?;
            count_write(Kind::Project, &project.name, "update");
            debug!(project = %project.name, "project: cleanup finalizer added");
        }

        if let Err(e) = self.reconcile_active(&project, &seeds, &cancel).await {
            self.recorder.warning(&project, "ReconcilingError", &e.to_string()).await;
            return Err(e);
        }
        Ok(Action::done())
    }
}

/// Keys of every Project, for secondary triggers such as a Seed change.
/// A list failure is logged and yields nothing.
pub fn enqueue_all_projects(control: &dyn ResourceStore) -> Vec<ObjectKey> {
    match control.list(Kind::Project, None) {
        Ok(projects) => projects.iter().map(ManagedResource::key).collect(),
        Err(e) => {
            error!(error = %e, "project: failed to list projects");
            Vec::new()
        }
    }
}
