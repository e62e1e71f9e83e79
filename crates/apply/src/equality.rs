//! Semantic equality between desired and live objects.

use serde_json::{Map, Value as Json};

use seedling_core::{ManagedResource, Result, LAST_APPLIED_ANNOTATION};

use crate::strip_noisy;

/// Deep equality that ignores the difference between a missing field, `null`
/// and an empty map/list, the way the API server normalizes omitempty fields.
/// Server-populated metadata and status are not compared.
pub fn semantic_eq(a: &ManagedResource, b: &ManagedResource) -> bool {
    applied_view(a) == applied_view(b)
}

/// Whether the value behind `pointer` differs between the two objects.
pub fn field_changed(existing: &ManagedResource, desired: &ManagedResource, pointer: &str) -> bool {
    let norm = |v: Option<&Json>| v.cloned().map(normalize).unwrap_or(Json::Null);
    norm(existing.field(pointer)) != norm(desired.field(pointer))
}

/// Canonical serialization of desired state stored in the last-applied annotation.
///
/// Server-populated metadata, status and the annotation itself are left out,
/// so the snapshot only changes when the creator's output changes.
pub fn last_applied_snapshot(desired: &ManagedResource) -> Result<String> {
    let v = applied_view(desired);
    Ok(serde_json::to_string(&v)?)
}

/// Object JSON as the engine applies it: noise stripped, last-applied kept if present.
pub fn applied_view(res: &ManagedResource) -> Json {
    let mut v = strip_noisy(res.to_object_json());
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        if let Some(ann) = meta.get_mut("annotations").and_then(Json::as_object_mut) {
            ann.remove(LAST_APPLIED_ANNOTATION);
        }
    }
    normalize(v)
}

/// Drop nulls and empty containers inside objects, recursively.
pub fn normalize(v: Json) -> Json {
    match v {
        Json::Object(m) => {
            let mut out = Map::new();
            for (k, v) in m {
                let v = normalize(v);
                let empty = match &v {
                    Json::Null => true,
                    Json::Object(o) => o.is_empty(),
                    Json::Array(a) => a.is_empty(),
                    _ => false,
                };
                if !empty { out.insert(k, v); }
            }
            Json::Object(out)
        }
        Json::Array(a) => Json::Array(a.into_iter().map(normalize).collect()),
        other => other,
    }
}
