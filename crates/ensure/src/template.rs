//! Inputs handed to cluster component creators.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use seedling_core::{Error, Kind, ManagedResource, ObjectKey, OwnerRef, Result};
use seedling_store::ResourceStore;

/// Pointer to the datacenter a Cluster runs in.
pub const DATACENTER_FIELD: &str = "/spec/cloud/dc";
pub const MACHINE_NETWORKS_FIELD: &str = "/spec/machineNetworks";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datacenter {
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub provider: String,
    /// Provider-specific settings, opaque to the engine.
    #[serde(default)]
    pub spec: Json,
}

/// Operator-wide knobs every cluster's components see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSettings {
    pub overwrite_registry: Option<String>,
    pub node_port_range: String,
    pub node_access_network: String,
    pub etcd_disk_size: String,
}

impl Default for TemplateSettings {
    fn default() -> Self {
        Self {
            overwrite_registry: None,
            node_port_range: "30000-32767".into(),
            node_access_network: "10.254.0.0/16".into(),
            etcd_disk_size: "5Gi".into(),
        }
    }
}

#[derive(Clone)]
pub struct TemplateData {
    pub cluster: ManagedResource,
    /// Namespace holding the cluster's control plane.
    pub namespace: String,
    pub datacenter: Datacenter,
    pub settings: TemplateSettings,
    reader: Arc<dyn ResourceStore>,
}

impl TemplateData {
    pub fn cluster_owner_ref(&self) -> Option<OwnerRef> { self.cluster.owner_reference(true) }

    pub fn machine_networks(&self) -> Vec<Json> {
        self.cluster.field(MACHINE_NETWORKS_FIELD).and_then(Json::as_array).cloned().unwrap_or_default()
    }

    pub fn has_machine_networks(&self) -> bool { !self.machine_networks().is_empty() }

    /// Image reference, rewritten to the override registry when one is set.
    pub fn image(&self, registry: &str, path: &str) -> String {
        format!("{}/{}", self.settings.overwrite_registry.as_deref().unwrap_or(registry), path)
    }

    /// Cached read of an object in the cluster namespace.
    pub fn lookup(&self, kind: Kind, name: &str) -> Result<ManagedResource> {
        let ns = kind.namespaced().then_some(self.namespace.as_str());
        self.reader.get(kind, &ObjectKey::new(ns, name))
    }
}

pub trait TemplateDataProvider: Send + Sync {
    fn template_data(&self, cluster: &ManagedResource) -> Result<TemplateData>;
}

/// Datacenters loaded once at startup.
pub struct StaticTemplateDataProvider {
    datacenters: BTreeMap<String, Datacenter>,
    settings: TemplateSettings,
    reader: Arc<dyn ResourceStore>,
}

impl StaticTemplateDataProvider {
    pub fn new(datacenters: impl IntoIterator<Item = Datacenter>, settings: TemplateSettings, reader: Arc<dyn ResourceStore>) -> Self {
        let datacenters = datacenters.into_iter().map(|dc| (dc.name.clone(), dc)).collect();
        Self { datacenters, settings, reader }
    }
}

impl TemplateDataProvider for StaticTemplateDataProvider {
    fn template_data(&self, cluster: &ManagedResource) -> Result<TemplateData> {
        let dc_name = cluster.field(DATACENTER_FIELD).and_then(Json::as_str).unwrap_or_default();
        let datacenter = self
            .datacenters
            .get(dc_name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("failed to get datacenter {}", dc_name)))?;
        let namespace = cluster_namespace(cluster)
            .ok_or_else(|| Error::Config(format!("cluster {} has no namespace yet", cluster.name)))?
            .to_string();
        Ok(TemplateData { cluster: cluster.clone(), namespace, datacenter, settings: self.settings.clone(), reader: Arc::clone(&self.reader) })
    }
}

/// `status.namespaceName` of a Cluster, when set.
pub fn cluster_namespace(cluster: &ManagedResource) -> Option<&str> {
    cluster.status.as_ref()?.get("namespaceName")?.as_str().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use seedling_store::MemoryStore;
    use serde_json::json;

    fn cluster(dc: &str) -> ManagedResource {
        ManagedResource::new(Kind::Cluster, None, "abc")
            .with_data("spec", json!({ "cloud": { "dc": dc }, "machineNetworks": [{ "cidr": "10.0.0.0/24" }] }))
            .with_status(json!({ "namespaceName": "cluster-abc" }))
    }

    fn provider() -> StaticTemplateDataProvider {
        let dc = Datacenter { name: "eu-west".into(), location: "Frankfurt".into(), provider: "hetzner".into(), spec: Json::Null };
        let settings = TemplateSettings { overwrite_registry: Some("mirror.local".into()), ..Default::default() };
        StaticTemplateDataProvider::new([dc], settings, Arc::new(MemoryStore::new("seed")))
    }

    #[tokio::test]
    async fn resolves_datacenter_and_namespace() {
        let data = provider().template_data(&cluster("eu-west")).unwrap();
        assert_eq!(data.namespace, "cluster-abc");
        assert_eq!(data.datacenter.location, "Frankfurt");
        assert!(data.has_machine_networks());
        assert_eq!(data.image("quay.io", "etcd:v3"), "mirror.local/etcd:v3");
        assert!(data.lookup(Kind::Secret, "ca").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn unknown_datacenter_is_an_error() {
        let err = provider().template_data(&cluster("mars-1")).err().unwrap();
        assert!(err.to_string().contains("failed to get datacenter mars-1"));
    }
}
