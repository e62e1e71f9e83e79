//! Managed object model and its Kubernetes JSON rendering.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::{Error, Kind, Result};

/// Namespace + name address of an object within one kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self { Self { namespace: None, name: name.into() } }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

/// An object the engine reads and writes.
///
/// `data` holds every top-level field except `apiVersion`, `kind`, `metadata`
/// and `status`; the engine treats it as opaque apart from the kind's
/// identity field and checksum payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedResource {
    pub kind: Kind,
    pub name: String,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub finalizers: Vec<String>,
    pub owner: Option<OwnerRef>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub resource_version: Option<String>,
    pub uid: Option<String>,
    pub data: Map<String, Json>,
    pub status: Option<Json>,
}

impl ManagedResource {
    pub fn new(kind: Kind, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            finalizers: Vec::new(),
            owner: None,
            deletion_timestamp: None,
            resource_version: None,
            uid: None,
            data: Map::new(),
            status: None,
        }
    }

    pub fn key(&self) -> ObjectKey { ObjectKey { namespace: self.namespace.clone(), name: self.name.clone() } }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_data(mut self, field: impl Into<String>, value: Json) -> Self {
        self.data.insert(field.into(), value);
        self
    }

    pub fn with_status(mut self, status: Json) -> Self {
        self.status = Some(status);
        self
    }

    pub fn annotation(&self, key: &str) -> Option<&str> { self.annotations.get(key).map(String::as_str) }

    pub fn has_finalizer(&self, finalizer: &str) -> bool { self.finalizers.iter().any(|f| f == finalizer) }

    /// Returns true when the finalizer was added.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) { return false; }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Returns true when the finalizer was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }

    pub fn is_deleting(&self) -> bool { self.deletion_timestamp.is_some() }

    /// Resolve a JSON pointer (`/spec/selector`) against the payload.
    pub fn field(&self, pointer: &str) -> Option<&Json> {
        let rest = pointer.strip_prefix('/')?;
        let (head, tail) = match rest.split_once('/') {
            Some((h, t)) => (h, Some(t)),
            None => (rest, None),
        };
        let top = self.data.get(head)?;
        match tail {
            Some(t) => top.pointer(&format!("/{}", t)),
            None => Some(top),
        }
    }

    /// Owner reference pointing at this object; None until the store assigned a uid.
    pub fn owner_reference(&self, controller: bool) -> Option<OwnerRef> {
        let uid = self.uid.clone()?;
        Some(OwnerRef {
            api_version: self.kind.api_version(),
            kind: self.kind.kind_name().to_string(),
            name: self.name.clone(),
            uid,
            controller: Some(controller),
            block_owner_deletion: Some(controller),
        })
    }

    /// Render as a Kubernetes object (`apiVersion`, `kind`, `metadata`, payload, `status`).
    pub fn to_object_json(&self) -> Json {
        let mut meta = Map::new();
        meta.insert("name".into(), Json::String(self.name.clone()));
        if let Some(ns) = &self.namespace { meta.insert("namespace".into(), Json::String(ns.clone())); }
        if !self.labels.is_empty() { meta.insert("labels".into(), string_map(&self.labels)); }
        if !self.annotations.is_empty() { meta.insert("annotations".into(), string_map(&self.annotations)); }
        if !self.finalizers.is_empty() {
            meta.insert("finalizers".into(), Json::Array(self.finalizers.iter().cloned().map(Json::String).collect()));
        }
        if let Some(owner) = &self.owner {
            if let Ok(v) = serde_json::to_value(owner) { meta.insert("ownerReferences".into(), Json::Array(vec![v])); }
        }
        if let Some(ts) = &self.deletion_timestamp {
            meta.insert("deletionTimestamp".into(), Json::String(ts.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        if let Some(rv) = &self.resource_version { meta.insert("resourceVersion".into(), Json::String(rv.clone())); }
        if let Some(uid) = &self.uid { meta.insert("uid".into(), Json::String(uid.clone())); }

        let mut obj = Map::new();
        obj.insert("apiVersion".into(), Json::String(self.kind.api_version()));
        obj.insert("kind".into(), Json::String(self.kind.kind_name().to_string()));
        obj.insert("metadata".into(), Json::Object(meta));
        for (k, v) in &self.data { obj.insert(k.clone(), v.clone()); }
        if let Some(status) = &self.status { obj.insert("status".into(), status.clone()); }
        Json::Object(obj)
    }

    /// Parse a Kubernetes object. Unknown metadata fields (managedFields, generation, ...) are dropped.
    pub fn from_object_json(kind: Kind, value: Json) -> Result<Self> {
        let Json::Object(mut obj) = value else {
            return Err(Error::serialization(format!("{} is not a JSON object", kind)));
        };
        obj.remove("apiVersion");
        obj.remove("kind");
        let status = obj.remove("status").filter(|s| !s.is_null());
        let meta = match obj.remove("metadata") {
            Some(Json::Object(m)) => m,
            _ => return Err(Error::serialization(format!("{} missing metadata", kind))),
        };
        let name = meta
            .get("name")
            .and_then(Json::as_str)
            .ok_or_else(|| Error::serialization(format!("{} missing metadata.name", kind)))?
            .to_string();
        let namespace = meta.get("namespace").and_then(Json::as_str).filter(|s| !s.is_empty()).map(str::to_string);
        let labels = parse_string_map(meta.get("labels"))?;
        let annotations = parse_string_map(meta.get("annotations"))?;
        let finalizers = match meta.get("finalizers") {
            Some(v) if !v.is_null() => serde_json::from_value(v.clone())?,
            _ => Vec::new(),
        };
        let owner = match meta.get("ownerReferences").and_then(Json::as_array).and_then(|a| a.first()) {
            Some(v) => Some(serde_json::from_value(v.clone())?),
            None => None,
        };
        let deletion_timestamp = match meta.get("deletionTimestamp").and_then(Json::as_str) {
            Some(s) => Some(
                DateTime::parse_from_rfc3339(s)
                    .map_err(|e| Error::serialization(format!("invalid deletionTimestamp {}: {}", s, e)))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };
        let resource_version = meta.get("resourceVersion").and_then(Json::as_str).map(str::to_string);
        let uid = meta.get("uid").and_then(Json::as_str).map(str::to_string);

        Ok(Self { kind, name, namespace, labels, annotations, finalizers, owner, deletion_timestamp, resource_version, uid, data: obj, status })
    }
}

fn string_map(m: &BTreeMap<String, String>) -> Json {
    Json::Object(m.iter().map(|(k, v)| (k.clone(), Json::String(v.clone()))).collect())
}

fn parse_string_map(v: Option<&Json>) -> Result<BTreeMap<String, String>> {
    match v {
        Some(v) if !v.is_null() => Ok(serde_json::from_value(v.clone())?),
        _ => Ok(BTreeMap::new()),
    }
}
