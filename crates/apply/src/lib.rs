//! Seedling apply: change detection and patch computation.
//!
//! - `checksum`: order-independent CRC-32 payload fingerprint
//! - `merge`: RFC 7386 merge patches and the three-way variant
//! - `equality`: semantic equality and the last-applied snapshot

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod checksum;
pub mod equality;
pub mod merge;

pub use checksum::{checksum_entries, checksum_for_bytes_map, checksum_for_string_map, encode_secret_value, payload_checksum};
pub use equality::{applied_view, field_changed, last_applied_snapshot, normalize, semantic_eq};
pub use merge::{apply_merge_patch, create_merge_patch, three_way_merge_patch};

/// Leaf-level change counts between two documents, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl std::ops::AddAssign for DiffSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.adds += rhs.adds;
        self.updates += rhs.updates;
        self.removes += rhs.removes;
    }
}

/// Metadata the API server owns.
const SERVER_METADATA: [&str; 6] = ["managedFields", "resourceVersion", "generation", "creationTimestamp", "deletionTimestamp", "uid"];

/// Drop server-owned metadata and `status` from an object document.
pub fn strip_noisy(mut v: Json) -> Json {
    let Some(obj) = v.as_object_mut() else { return v };
    obj.remove("status");
    if let Some(meta) = obj.get_mut("metadata").and_then(Json::as_object_mut) {
        for field in SERVER_METADATA { meta.remove(field); }
    }
    v
}

/// Count how `target` differs from `base`: keys only in `target` are adds,
/// keys only in `base` are removes, differing scalars and array slots are updates.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    let mut out = DiffSummary::default();
    match (target, base) {
        (Json::Object(t), Json::Object(b)) => {
            for (k, tv) in t {
                match b.get(k) {
                    Some(bv) if bv == tv => {}
                    Some(bv) => out += diff_summary(tv, bv),
                    None => out.adds += 1,
                }
            }
            out.removes += b.keys().filter(|k| !t.contains_key(*k)).count();
        }
        (Json::Array(t), Json::Array(b)) => {
            out.updates += t.iter().zip(b).filter(|(x, y)| x != y).count();
            out.adds += t.len().saturating_sub(b.len());
            out.removes += b.len().saturating_sub(t.len());
        }
        (t, b) if t != b => out.updates += 1,
        _ => {}
    }
    out
}

/// Diff summary between two objects as the engine compares them.
pub fn explain(desired: &seedling_core::ManagedResource, existing: &seedling_core::ManagedResource) -> DiffSummary {
    diff_summary(&applied_view(desired), &applied_view(existing))
}
