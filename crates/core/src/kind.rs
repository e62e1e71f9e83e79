//! Built-in kinds managed by the engine.
//!
//! This module provides:
//! - A closed set of kind tags with stable metric names
//! - G/V/K mapping used by the kube backend and object JSON rendering
//! - Scope (namespaced vs cluster-scoped) per kind

use std::fmt;

use serde::{Deserialize, Serialize};

/// Group used by the platform's own custom resources.
pub const SEEDLING_GROUP: &str = "seedling.io";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    Namespace,
    ServiceAccount,
    Role,
    RoleBinding,
    ClusterRoleBinding,
    Service,
    Secret,
    ConfigMap,
    Deployment,
    StatefulSet,
    PodDisruptionBudget,
    Cluster,
    Project,
    Seed,
}

impl Kind {
    pub const ALL: [Kind; 14] = [
        Kind::Namespace,
        Kind::ServiceAccount,
        Kind::Role,
        Kind::RoleBinding,
        Kind::ClusterRoleBinding,
        Kind::Service,
        Kind::Secret,
        Kind::ConfigMap,
        Kind::Deployment,
        Kind::StatefulSet,
        Kind::PodDisruptionBudget,
        Kind::Cluster,
        Kind::Project,
        Kind::Seed,
    ];

    /// Lowercase name used for metric labels and log fields.
    pub const fn as_str(self) -> &'static str {
        match self {
            Kind::Namespace => "namespace",
            Kind::ServiceAccount => "serviceaccount",
            Kind::Role => "role",
            Kind::RoleBinding => "rolebinding",
            Kind::ClusterRoleBinding => "clusterrolebinding",
            Kind::Service => "service",
            Kind::Secret => "secret",
            Kind::ConfigMap => "configmap",
            Kind::Deployment => "deployment",
            Kind::StatefulSet => "statefulset",
            Kind::PodDisruptionBudget => "poddisruptionbudget",
            Kind::Cluster => "cluster",
            Kind::Project => "project",
            Kind::Seed => "seed",
        }
    }

    /// Kubernetes `kind` field value.
    pub const fn kind_name(self) -> &'static str {
        match self {
            Kind::Namespace => "Namespace",
            Kind::ServiceAccount => "ServiceAccount",
            Kind::Role => "Role",
            Kind::RoleBinding => "RoleBinding",
            Kind::ClusterRoleBinding => "ClusterRoleBinding",
            Kind::Service => "Service",
            Kind::Secret => "Secret",
            Kind::ConfigMap => "ConfigMap",
            Kind::Deployment => "Deployment",
            Kind::StatefulSet => "StatefulSet",
            Kind::PodDisruptionBudget => "PodDisruptionBudget",
            Kind::Cluster => "Cluster",
            Kind::Project => "Project",
            Kind::Seed => "Seed",
        }
    }

    pub const fn group(self) -> &'static str {
        match self {
            Kind::Namespace | Kind::ServiceAccount | Kind::Service | Kind::Secret | Kind::ConfigMap => "",
            Kind::Role | Kind::RoleBinding | Kind::ClusterRoleBinding => "rbac.authorization.k8s.io",
            Kind::Deployment | Kind::StatefulSet => "apps",
            Kind::PodDisruptionBudget => "policy",
            Kind::Cluster | Kind::Project | Kind::Seed => SEEDLING_GROUP,
        }
    }

    pub const fn version(self) -> &'static str { "v1" }

    /// `apiVersion` as rendered in object JSON (`v1` for the core group).
    pub fn api_version(self) -> String {
        if self.group().is_empty() { self.version().to_string() } else { format!("{}/{}", self.group(), self.version()) }
    }

    pub const fn namespaced(self) -> bool {
        !matches!(self, Kind::Namespace | Kind::ClusterRoleBinding | Kind::Cluster | Kind::Project)
    }

    /// Resolve a `kind` field value back into a tag.
    pub fn from_kind_name(name: &str) -> Option<Kind> {
        Kind::ALL.into_iter().find(|k| k.kind_name() == name)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_version_for_core_and_grouped_kinds() {
        assert_eq!(Kind::Secret.api_version(), "v1");
        assert_eq!(Kind::Deployment.api_version(), "apps/v1");
        assert_eq!(Kind::PodDisruptionBudget.api_version(), "policy/v1");
        assert_eq!(Kind::Project.api_version(), "seedling.io/v1");
    }

    #[test]
    fn kind_names_round_trip() {
        for k in Kind::ALL {
            assert_eq!(Kind::from_kind_name(k.kind_name()), Some(k));
        }
        assert_eq!(Kind::from_kind_name("Pod"), None);
    }

    #[test]
    fn scope_matches_kubernetes() {
        assert!(!Kind::Namespace.namespaced());
        assert!(!Kind::ClusterRoleBinding.namespaced());
        assert!(!Kind::Project.namespaced());
        assert!(Kind::Secret.namespaced());
        assert!(Kind::Seed.namespaced());
    }
}
