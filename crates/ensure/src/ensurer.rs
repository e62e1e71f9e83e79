//! Create / compare / update / recreate loop over one kind entry.

use std::ops::AddAssign;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use seedling_apply::{applied_view, field_changed, last_applied_snapshot, payload_checksum, semantic_eq, strip_noisy, three_way_merge_patch};
use seedling_core::{
    DeletePropagation, EqualityRule, Error, Kind, ManagedResource, ObjectKey, Result, CHECKSUM_ANNOTATION, LAST_APPLIED_ANNOTATION,
};
use seedling_store::ResourceStore;

use crate::kinds::{KindEntry, KindSpec, NamedCreator};

/// Cache poll after an ordered create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self { Self { timeout: Duration::from_secs(30), interval: Duration::from_millis(100) } }
}

/// Writes issued by one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnsureReport {
    pub created: usize,
    pub updated: usize,
    pub patched: usize,
    /// Objects deleted for recreation on the next pass.
    pub deleted: usize,
    pub unchanged: usize,
}

impl EnsureReport {
    pub fn writes(&self) -> usize { self.created + self.updated + self.patched + self.deleted }
    pub fn is_noop(&self) -> bool { self.writes() == 0 }
}

impl AddAssign for EnsureReport {
    fn add_assign(&mut self, o: Self) {
        self.created += o.created;
        self.updated += o.updated;
        self.patched += o.patched;
        self.deleted += o.deleted;
        self.unchanged += o.unchanged;
    }
}

/// Count a write the way every controller in the workspace reports them.
pub fn count_write(kind: Kind, name: &str, op: &'static str) {
    metrics::counter!("seedling_resource_writes_total", 1u64, "kind" => kind.as_str(), "name" => name.to_string(), "op" => op);
}

#[derive(Clone)]
pub struct ResourceEnsurer {
    store: Arc<dyn ResourceStore>,
    wait: WaitConfig,
}

impl ResourceEnsurer {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self { Self { store, wait: WaitConfig::default() } }

    pub fn with_wait(mut self, wait: WaitConfig) -> Self {
        self.wait = wait;
        self
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> { &self.store }

    /// Converge every (name, creator) pair of `entry`. Stops at the first error.
    pub async fn ensure_kind<C: Sync>(
        &self,
        ctx: &C,
        namespace: Option<&str>,
        entry: &KindEntry<C>,
        cancel: &CancellationToken,
    ) -> Result<EnsureReport> {
        let spec = entry.spec;
        let namespace = if spec.kind.namespaced() { namespace } else { None };
        let mut report = EnsureReport::default();
        for creator in &entry.creators {
            if cancel.is_cancelled() {
                return Err(Error::cancelled(format!("ensuring {} {}", spec.kind, creator.name)));
            }
            let key = ObjectKey::new(namespace, creator.name.as_str());
            report += self.ensure_one(ctx, &spec, &key, creator, cancel).await?;
        }
        Ok(report)
    }

    async fn ensure_one<C: Sync>(
        &self,
        ctx: &C,
        spec: &KindSpec,
        key: &ObjectKey,
        creator: &NamedCreator<C>,
        cancel: &CancellationToken,
    ) -> Result<EnsureReport> {
        let kind = spec.kind;
        let cached = match self.store.get(kind, key) {
            Err(e) if e.is_not_found() => self.store.fetch(kind, key).await.inspect(|_| {
                debug!(kind = %kind, key = %key, "ensure: cache miss but object exists; comparing live copy");
            }),
            other => other,
        };
        let existing = match cached {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => {
                let mut desired = build(spec, key, creator, ctx, None)?;
                stamp(spec.rule, &mut desired)?;
                self.store.create(&desired).await?;
                count_write(kind, &key.name, "create");
                info!(kind = %kind, key = %key, "ensure: created");
                if spec.ordered {
                    self.wait_for_cache(kind, key, cancel).await?;
                }
                return Ok(EnsureReport { created: 1, ..Default::default() });
            }
            Err(e) => return Err(e),
        };

        let mut desired = build(spec, key, creator, ctx, Some(existing.clone()))?;
        match spec.rule {
            EqualityRule::Structural => {
                if semantic_eq(&desired, &existing) {
                    return Ok(unchanged());
                }
            }
            EqualityRule::Checksum => {
                stamp(spec.rule, &mut desired)?;
                if existing.annotation(CHECKSUM_ANNOTATION).is_some() && existing.annotation(CHECKSUM_ANNOTATION) == desired.annotation(CHECKSUM_ANNOTATION) {
                    return Ok(unchanged());
                }
            }
            EqualityRule::ThreeWayPatch => {
                let snapshot = last_applied_snapshot(&desired)?;
                if existing.annotation(LAST_APPLIED_ANNOTATION) == Some(snapshot.as_str()) {
                    return Ok(unchanged());
                }
                desired.annotations.insert(LAST_APPLIED_ANNOTATION.to_string(), snapshot);
                let patch = three_way_patch(&existing, &desired)?;
                self.store.patch(kind, key, &patch).await?;
                count_write(kind, &key.name, "patch");
                info!(kind = %kind, key = %key, "ensure: patched");
                return Ok(EnsureReport { patched: 1, ..Default::default() });
            }
        }

        if let Some(pointer) = spec.immutable_field {
            if field_changed(&existing, &desired, pointer) {
                self.store.delete(kind, key, DeletePropagation::Foreground).await?;
                count_write(kind, &key.name, "delete");
                info!(kind = %kind, key = %key, field = pointer, "ensure: immutable field changed; deleted for recreation");
                return Ok(EnsureReport { deleted: 1, ..Default::default() });
            }
        }

        if desired.resource_version.is_none() {
            desired.resource_version = existing.resource_version.clone();
        }
        let diff = seedling_apply::explain(&desired, &existing);
        self.store.update(&desired).await?;
        count_write(kind, &key.name, "update");
        info!(kind = %kind, key = %key, adds = diff.adds, updates = diff.updates, removes = diff.removes, "ensure: updated");
        Ok(EnsureReport { updated: 1, ..Default::default() })
    }

    /// Poll the cache until the object shows up. Read errors other than
    /// NotFound are logged and polling continues.
    async fn wait_for_cache(&self, kind: Kind, key: &ObjectKey, cancel: &CancellationToken) -> Result<()> {
        let started = Instant::now();
        loop {
            match self.store.get(kind, key) {
                Ok(_) => {
                    debug!(kind = %kind, key = %key, took_ms = started.elapsed().as_millis() as u64, "ensure: object reached the cache");
                    return Ok(());
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(kind = %kind, key = %key, error = %e, "ensure: cache read failed while waiting"),
            }
            if started.elapsed() >= self.wait.timeout {
                return Err(Error::Timeout { kind, key: key.clone(), waited: self.wait.timeout });
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::cancelled(format!("waiting for {} {} to reach the cache", kind, key)));
                }
                _ = tokio::time::sleep(self.wait.interval) => {}
            }
        }
    }
}

fn unchanged() -> EnsureReport { EnsureReport { unchanged: 1, ..Default::default() } }

/// Run the creator and pin the result to the entry's kind, name and namespace.
fn build<C>(spec: &KindSpec, key: &ObjectKey, creator: &NamedCreator<C>, ctx: &C, existing: Option<ManagedResource>) -> Result<ManagedResource> {
    let mut desired = (creator.create)(ctx, existing).map_err(|e| match e {
        e @ Error::Creator { .. } => e,
        other => Error::creator(spec.kind, key.name.clone(), other.to_string()),
    })?;
    if desired.kind != spec.kind {
        return Err(Error::creator(spec.kind, key.name.clone(), format!("creator returned a {}", desired.kind)));
    }
    desired.name = key.name.clone();
    desired.namespace = key.namespace.clone();
    Ok(desired)
}

fn stamp(rule: EqualityRule, desired: &mut ManagedResource) -> Result<()> {
    match rule {
        EqualityRule::Structural => {}
        EqualityRule::Checksum => {
            let sum = payload_checksum(desired)?;
            desired.annotations.insert(CHECKSUM_ANNOTATION.to_string(), sum);
        }
        EqualityRule::ThreeWayPatch => {
            let snapshot = last_applied_snapshot(desired)?;
            desired.annotations.insert(LAST_APPLIED_ANNOTATION.to_string(), snapshot);
        }
    }
    Ok(())
}

/// Patch from `existing` towards `desired`, deleting only what the previous
/// last-applied snapshot set. A missing snapshot means nothing is deleted.
fn three_way_patch(existing: &ManagedResource, desired: &ManagedResource) -> Result<Json> {
    let original = match existing.annotation(LAST_APPLIED_ANNOTATION) {
        Some(raw) => Some(serde_json::from_str::<Json>(raw)?),
        None => {
            debug!(kind = %existing.kind, key = %existing.key(), "ensure: no last-applied annotation; treating as empty");
            None
        }
    };
    let mut modified = applied_view(desired);
    if let Some(snapshot) = desired.annotation(LAST_APPLIED_ANNOTATION) {
        modified["metadata"]["annotations"][LAST_APPLIED_ANNOTATION] = Json::String(snapshot.to_string());
    }
    let current = strip_noisy(existing.to_object_json());
    three_way_merge_patch(original.as_ref(), &modified, &current)
}
