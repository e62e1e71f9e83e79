//! Seedling kubehub: kube-rs backed store, watches, events and seed clients.

#![forbid(unsafe_code)]

use kube::core::{ApiResource, GroupVersionKind};
use seedling_core::{Error, Kind, ObjectKey};

mod events;
mod seeds;
mod store;
mod watch;

pub use events::KubeEventRecorder;
pub use seeds::{client_from_kubeconfig, seed_identity, seed_kubeconfig_ref, sync_seed_registry, KUBECONFIG_KEY};
pub use store::KubeStore;
pub use watch::watch_keys;

/// Lowercase plural resource name served by the API.
pub const fn plural(kind: Kind) -> &'static str {
    match kind {
        Kind::Namespace => "namespaces",
        Kind::ServiceAccount => "serviceaccounts",
        Kind::Role => "roles",
        Kind::RoleBinding => "rolebindings",
        Kind::ClusterRoleBinding => "clusterrolebindings",
        Kind::Service => "services",
        Kind::Secret => "secrets",
        Kind::ConfigMap => "configmaps",
        Kind::Deployment => "deployments",
        Kind::StatefulSet => "statefulsets",
        Kind::PodDisruptionBudget => "poddisruptionbudgets",
        Kind::Cluster => "clusters",
        Kind::Project => "projects",
        Kind::Seed => "seeds",
    }
}

pub fn api_resource(kind: Kind) -> ApiResource {
    let gvk = GroupVersionKind::gvk(kind.group(), kind.version(), kind.kind_name());
    ApiResource::from_gvk_with_plural(&gvk, plural(kind))
}

/// Map a kube client error onto the engine's error variants by HTTP status.
pub fn map_kube_error(kind: Kind, key: &ObjectKey, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(resp) => match resp.code {
            404 => Error::not_found(kind, key.clone()),
            409 if resp.reason == "AlreadyExists" => Error::AlreadyExists { kind, key: key.clone() },
            409 => Error::Conflict { kind, key: key.clone(), message: resp.message },
            400 | 422 => Error::Rejected { kind, key: key.clone(), message: resp.message },
            code => Error::backend(format!("{} {} (HTTP {})", kind, key, code), resp.message),
        },
        other => Error::backend(format!("{} {}", kind, key), other.to_string()),
    }
}
