//! Kind table: how each managed kind is compared, and which creators build it.

use std::fmt;
use std::sync::Arc;

use seedling_core::{EqualityRule, Kind, ManagedResource, Result};

/// Builds the desired object. `existing` is an owned copy of the cached object, if any.
pub type Creator<C> = Arc<dyn Fn(&C, Option<ManagedResource>) -> Result<ManagedResource> + Send + Sync>;

pub struct NamedCreator<C> {
    pub name: String,
    pub create: Creator<C>,
}

impl<C> NamedCreator<C> {
    pub fn new<F>(name: impl Into<String>, create: F) -> Self
    where
        F: Fn(&C, Option<ManagedResource>) -> Result<ManagedResource> + Send + Sync + 'static,
    {
        Self { name: name.into(), create: Arc::new(create) }
    }
}

impl<C> Clone for NamedCreator<C> {
    fn clone(&self) -> Self { Self { name: self.name.clone(), create: Arc::clone(&self.create) } }
}

impl<C> fmt::Debug for NamedCreator<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.debug_struct("NamedCreator").field("name", &self.name).finish() }
}

/// Per-kind reconcile behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindSpec {
    pub kind: Kind,
    pub rule: EqualityRule,
    /// JSON pointer to a field the API server refuses to update.
    pub immutable_field: Option<&'static str>,
    /// Create strictly in declared order, waiting for each object to reach the cache.
    pub ordered: bool,
}

pub const SELECTOR_MATCH_LABELS: &str = "/spec/selector/matchLabels";

impl KindSpec {
    pub const fn structural(kind: Kind) -> Self { Self { kind, rule: EqualityRule::Structural, immutable_field: None, ordered: false } }

    pub const fn checksum(kind: Kind) -> Self { Self { kind, rule: EqualityRule::Checksum, immutable_field: None, ordered: false } }

    /// Legacy Secrets: three-way patch, ordered creation.
    pub const fn legacy_secrets() -> Self {
        Self { kind: Kind::Secret, rule: EqualityRule::ThreeWayPatch, immutable_field: None, ordered: true }
    }

    /// Structural, but a changed pod selector forces delete + recreate.
    pub const fn workload(kind: Kind) -> Self {
        Self { kind, rule: EqualityRule::Structural, immutable_field: Some(SELECTOR_MATCH_LABELS), ordered: false }
    }
}

/// One kind's spec plus its (name, creator) pairs, in declared order.
pub struct KindEntry<C> {
    pub spec: KindSpec,
    pub creators: Vec<NamedCreator<C>>,
}

impl<C> KindEntry<C> {
    pub fn new(spec: KindSpec) -> Self { Self { spec, creators: Vec::new() } }

    pub fn with<F>(mut self, name: impl Into<String>, create: F) -> Self
    where
        F: Fn(&C, Option<ManagedResource>) -> Result<ManagedResource> + Send + Sync + 'static,
    {
        self.creators.push(NamedCreator::new(name, create));
        self
    }
}

/// Stages of the cluster component pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    ServiceAccounts,
    Roles,
    RoleBindings,
    ClusterRoleBindings,
    Services,
    LegacySecrets,
    Secrets,
    ConfigMaps,
    Deployments,
    StatefulSets,
    PodDisruptionBudgets,
}

impl Stage {
    pub const PIPELINE: [Stage; 11] = [
        Stage::ServiceAccounts,
        Stage::Roles,
        Stage::RoleBindings,
        Stage::ClusterRoleBindings,
        Stage::Services,
        Stage::LegacySecrets,
        Stage::Secrets,
        Stage::ConfigMaps,
        Stage::Deployments,
        Stage::StatefulSets,
        Stage::PodDisruptionBudgets,
    ];

    pub const fn spec(self) -> KindSpec {
        match self {
            Stage::ServiceAccounts => KindSpec::structural(Kind::ServiceAccount),
            Stage::Roles => KindSpec::structural(Kind::Role),
            Stage::RoleBindings => KindSpec::structural(Kind::RoleBinding),
            Stage::ClusterRoleBindings => KindSpec::structural(Kind::ClusterRoleBinding),
            Stage::Services => KindSpec::structural(Kind::Service),
            Stage::LegacySecrets => KindSpec::legacy_secrets(),
            Stage::Secrets => KindSpec::checksum(Kind::Secret),
            Stage::ConfigMaps => KindSpec::checksum(Kind::ConfigMap),
            Stage::Deployments => KindSpec::workload(Kind::Deployment),
            Stage::StatefulSets => KindSpec::workload(Kind::StatefulSet),
            Stage::PodDisruptionBudgets => KindSpec::structural(Kind::PodDisruptionBudget),
        }
    }
}
