//! Seed clients: every `Seed` on the control plane names a Secret holding a
//! kubeconfig for that seed cluster.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info};

use seedling_core::{Error, Kind, ManagedResource, ObjectKey, Result};
use seedling_store::ResourceStore;
use seedling_sync::{RegistryHandle, SeedTopology};

use crate::store::KubeStore;
use crate::watch::dynamic_api;

pub const KUBECONFIG_KEY: &str = "kubeconfig";

/// The Secret referenced by `spec.kubeconfig`; namespace defaults to the Seed's own.
pub fn seed_kubeconfig_ref(seed: &ManagedResource) -> Result<ObjectKey> {
    let name = seed
        .field("/spec/kubeconfig/name")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Config(format!("seed {} has no spec.kubeconfig.name", seed.name)))?;
    let namespace = seed
        .field("/spec/kubeconfig/namespace")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| seed.namespace.clone());
    Ok(ObjectKey::new(namespace.as_deref(), name))
}

fn kubeconfig_from_secret(secret: &ManagedResource) -> Result<Kubeconfig> {
    let pointer = format!("/data/{}", KUBECONFIG_KEY);
    let encoded = secret
        .field(&pointer)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Config(format!("secret {} has no {} key", secret.key(), KUBECONFIG_KEY)))?;
    let raw = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| Error::Config(format!("secret {}: invalid base64: {}", secret.key(), e)))?;
    let text = String::from_utf8(raw).map_err(|e| Error::Config(format!("secret {}: {}", secret.key(), e)))?;
    Kubeconfig::from_yaml(&text).map_err(|e| Error::Config(format!("secret {}: invalid kubeconfig: {}", secret.key(), e)))
}

pub async fn client_from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Client> {
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::Config(format!("kubeconfig: {}", e)))?;
    Client::try_from(config).map_err(|e| Error::backend("seed client", e.to_string()))
}

/// Connection identity of a seed: its kubeconfig Secret and that Secret's
/// revision. A store is rebuilt only when this string changes.
pub fn seed_identity(secret_key: &ObjectKey, secret: &ManagedResource) -> String {
    format!("{}@{}", secret_key, secret.resource_version.as_deref().unwrap_or(""))
}

async fn connect_seed(name: String, secret: ManagedResource, sync_timeout: Duration) -> Result<Arc<dyn ResourceStore>> {
    let client = client_from_kubeconfig(kubeconfig_from_secret(&secret)?).await?;
    let store = KubeStore::new(name.clone(), client);
    store.watch_kind(Kind::Project, None);
    store.wait_synced(Kind::Project, sync_timeout).await?;
    debug!(seed = %name, secret = %secret.key(), "seeds: client ready");
    Ok(Arc::new(store) as Arc<dyn ResourceStore>)
}

/// Converge `handle` on the Seeds in `namespace`. Seeds whose kubeconfig is
/// unchanged keep their store; new stores are published only after their
/// Project cache has seen a full list. Any seed that cannot be reached fails
/// the whole sync so a partial topology never replaces a full one.
pub async fn sync_seed_registry(control: &KubeStore, namespace: &str, handle: &RegistryHandle, sync_timeout: Duration) -> Result<bool> {
    let api = dynamic_api(control.client().clone(), Kind::Seed, Some(namespace));
    let listed = api
        .list(&ListParams::default())
        .await
        .map_err(|e| crate::map_kube_error(Kind::Seed, &ObjectKey::namespaced(namespace, "*"), e))?;

    let mut topology = SeedTopology::new();
    let mut secrets = BTreeMap::new();
    for obj in listed {
        let seed = ManagedResource::from_object_json(Kind::Seed, serde_json::to_value(obj)?)?;
        let secret_key = seed_kubeconfig_ref(&seed)?;
        let secret = control.fetch(Kind::Secret, &secret_key).await?;
        topology.insert(seed.name.clone(), seed_identity(&secret_key, &secret));
        secrets.insert(seed.name, secret);
    }

    let swapped = handle
        .sync_topology(&topology, |name| {
            let secret = secrets.get(&name).cloned();
            async move {
                let secret = secret.ok_or_else(|| Error::Config(format!("seed {} has no kubeconfig", name)))?;
                connect_seed(name, secret, sync_timeout).await
            }
        })
        .await?;
    info!(seeds = topology.len(), namespace, swapped, "seeds: registry synced");
    Ok(swapped)
}
