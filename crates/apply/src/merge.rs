//! JSON merge patches (RFC 7386) and the three-way variant used for legacy Secrets.

use serde_json::{Map, Value as Json};

use seedling_core::{Error, Result};

/// Patch that turns `from` into `to`. Removed keys become `null`, arrays are replaced whole.
pub fn create_merge_patch(from: &Json, to: &Json) -> Json {
    match (from, to) {
        (Json::Object(a), Json::Object(b)) => {
            let mut patch = Map::new();
            for (k, av) in a {
                match b.get(k) {
                    None => { patch.insert(k.clone(), Json::Null); }
                    Some(bv) if av != bv => {
                        let change = if av.is_object() && bv.is_object() { create_merge_patch(av, bv) } else { bv.clone() };
                        patch.insert(k.clone(), change);
                    }
                    Some(_) => {}
                }
            }
            for (k, bv) in b {
                if !a.contains_key(k) { patch.insert(k.clone(), bv.clone()); }
            }
            Json::Object(patch)
        }
        _ => to.clone(),
    }
}

/// Apply a merge patch to `target`.
pub fn apply_merge_patch(target: &Json, patch: &Json) -> Json {
    let Json::Object(p) = patch else { return patch.clone() };
    let mut out = match target {
        Json::Object(t) => t.clone(),
        _ => Map::new(),
    };
    for (k, pv) in p {
        if pv.is_null() {
            out.remove(k);
        } else {
            let merged = apply_merge_patch(out.get(k).unwrap_or(&Json::Null), pv);
            out.insert(k.clone(), merged);
        }
    }
    Json::Object(out)
}

/// Three-way merge patch.
///
/// Additions and changes come from `current → modified` (nulls dropped, so
/// fields the engine never set survive); deletions come from
/// `original → modified` (only nulls kept, so only fields the engine itself
/// set before are removed). A missing `original` counts as `{}`.
pub fn three_way_merge_patch(original: Option<&Json>, modified: &Json, current: &Json) -> Result<Json> {
    let empty = Json::Object(Map::new());
    let original = original.unwrap_or(&empty);
    let add_and_change = filter_nulls(&create_merge_patch(current, modified), false);
    let deletions = filter_nulls(&create_merge_patch(original, modified), true);
    if let Some(path) = find_conflict(&add_and_change, &deletions, "") {
        return Err(Error::backend("three-way merge patch", format!("conflicting changes at {}", path)));
    }
    Ok(apply_merge_patch(&deletions, &add_and_change))
}

/// Keep only nulls (`keep_nulls`) or drop every null, recursing into maps.
fn filter_nulls(patch: &Json, keep_nulls: bool) -> Json {
    let Json::Object(m) = patch else { return patch.clone() };
    let mut out = Map::new();
    for (k, v) in m {
        match v {
            Json::Null => {
                if keep_nulls { out.insert(k.clone(), Json::Null); }
            }
            Json::Object(inner) => {
                let filtered = filter_nulls(v, keep_nulls);
                let is_empty = filtered.as_object().map(Map::is_empty).unwrap_or(true);
                // an explicit `{}` is a real change when additions are kept
                if !is_empty || (!keep_nulls && inner.is_empty()) { out.insert(k.clone(), filtered); }
            }
            other => {
                if !keep_nulls { out.insert(k.clone(), other.clone()); }
            }
        }
    }
    Json::Object(out)
}

fn find_conflict(left: &Json, right: &Json, path: &str) -> Option<String> {
    let (Json::Object(l), Json::Object(r)) = (left, right) else {
        return (left != right).then(|| if path.is_empty() { "/".to_string() } else { path.to_string() });
    };
    for (k, lv) in l {
        if let Some(rv) = r.get(k) {
            if let Some(p) = find_conflict(lv, rv, &format!("{}/{}", path, k)) { return Some(p); }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_then_apply_reaches_target() {
        let from = json!({ "a": 1, "b": { "x": 1, "y": 2 }, "c": [1, 2] });
        let to = json!({ "a": 2, "b": { "x": 1 }, "c": [3], "d": "new" });
        let patch = create_merge_patch(&from, &to);
        assert_eq!(patch, json!({ "a": 2, "b": { "y": null }, "c": [3], "d": "new" }));
        assert_eq!(apply_merge_patch(&from, &patch), to);
    }

    #[test]
    fn identical_documents_give_empty_patch() {
        let v = json!({ "a": { "b": [1] } });
        assert_eq!(create_merge_patch(&v, &v), json!({}));
    }

    #[test]
    fn external_fields_survive_three_way_patch() {
        // engine owned data.a; someone else added data.ext and a label
        let original = json!({ "data": { "a": "1" } });
        let modified = json!({ "data": { "a": "2" } });
        let current = json!({ "metadata": { "labels": { "team": "x" } }, "data": { "a": "1", "ext": "keep" } });
        let patch = three_way_merge_patch(Some(&original), &modified, &current).unwrap();
        assert_eq!(patch, json!({ "data": { "a": "2" } }));
        let applied = apply_merge_patch(&current, &patch);
        assert_eq!(applied["data"]["ext"], "keep");
        assert_eq!(applied["metadata"]["labels"]["team"], "x");
        assert_eq!(applied["data"]["a"], "2");
    }

    #[test]
    fn fields_dropped_by_engine_are_deleted() {
        let original = json!({ "data": { "a": "1", "old": "x" } });
        let modified = json!({ "data": { "a": "1" } });
        let current = json!({ "data": { "a": "1", "old": "x", "ext": "y" } });
        let patch = three_way_merge_patch(Some(&original), &modified, &current).unwrap();
        assert_eq!(patch, json!({ "data": { "old": null } }));
        assert_eq!(apply_merge_patch(&current, &patch), json!({ "data": { "a": "1", "ext": "y" } }));
    }

    #[test]
    fn missing_original_never_deletes() {
        let modified = json!({ "data": { "a": "1" } });
        let current = json!({ "data": { "a": "0", "ext": "y" } });
        let patch = three_way_merge_patch(None, &modified, &current).unwrap();
        assert_eq!(patch, json!({ "data": { "a": "1" } }));
    }

    #[test]
    fn converged_state_gives_empty_patch() {
        let doc = json!({ "data": { "a": "1" } });
        let patch = three_way_merge_patch(Some(&doc), &doc, &doc).unwrap();
        assert_eq!(patch, json!({}));
    }

    #[test]
    fn conflicts_are_reported_with_path() {
        let left = json!({ "a": { "b": 1 } });
        let right = json!({ "a": { "b": null } });
        assert_eq!(find_conflict(&left, &right, ""), Some("/a/b".to_string()));
        assert_eq!(find_conflict(&json!({ "a": 1 }), &json!({ "c": null }), ""), None);
    }
}
