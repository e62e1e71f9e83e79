//! Order-independent payload fingerprint.
//!
//! Entries render as `key:value`, get sorted bytewise, concatenated and run
//! through CRC-32 (IEEE). The result is a change detector only: two payloads
//! with the same CRC are indistinguishable and the second write is skipped.

use std::collections::BTreeMap;

use base64::Engine as _;
use seedling_core::{Error, Kind, ManagedResource, Result};
use serde_json::Value as Json;

/// Checksum over an unordered set of entries.
pub fn checksum_entries<I, K, V>(entries: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<[u8]>,
{
    let mut rendered: Vec<Vec<u8>> = entries
        .into_iter()
        .map(|(k, v)| {
            let (k, v) = (k.as_ref().as_bytes(), v.as_ref());
            let mut line = Vec::with_capacity(k.len() + 1 + v.len());
            line.extend_from_slice(k);
            line.push(b':');
            line.extend_from_slice(v);
            line
        })
        .collect();
    rendered.sort_unstable();
    let mut hasher = crc32fast::Hasher::new();
    for line in &rendered { hasher.update(line); }
    hasher.finalize().to_string()
}

pub fn checksum_for_string_map(data: &BTreeMap<String, String>) -> String {
    checksum_entries(data.iter().map(|(k, v)| (k, v.as_bytes())))
}

pub fn checksum_for_bytes_map(data: &BTreeMap<String, Vec<u8>>) -> String {
    checksum_entries(data.iter())
}

/// Checksum of the `data` map of a Secret or ConfigMap.
///
/// Secret values are base64 in object JSON and are decoded first, so the
/// fingerprint covers the actual bytes.
pub fn payload_checksum(res: &ManagedResource) -> Result<String> {
    let Some(data) = res.data.get("data").filter(|d| !d.is_null()) else {
        return Ok(checksum_entries(std::iter::empty::<(&str, &[u8])>()));
    };
    let map = data
        .as_object()
        .ok_or_else(|| Error::serialization(format!("{} {}: data is not a map", res.kind, res.key())))?;
    match res.kind {
        Kind::Secret => {
            let mut decoded = BTreeMap::new();
            for (k, v) in map {
                let raw = v.as_str().ok_or_else(|| non_string(res, k))?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(raw)
                    .map_err(|e| Error::serialization(format!("{} {}: data[{}] is not base64: {}", res.kind, res.key(), k, e)))?;
                decoded.insert(k.clone(), bytes);
            }
            Ok(checksum_for_bytes_map(&decoded))
        }
        _ => {
            let mut strings = Vec::with_capacity(map.len());
            for (k, v) in map {
                let s = v.as_str().ok_or_else(|| non_string(res, k))?;
                strings.push((k.as_str(), s.as_bytes()));
            }
            Ok(checksum_entries(strings))
        }
    }
}

fn non_string(res: &ManagedResource, key: &str) -> Error {
    Error::serialization(format!("{} {}: data[{}] is not a string", res.kind, res.key(), key))
}

/// Base64 helper for building Secret payloads.
pub fn encode_secret_value(bytes: &[u8]) -> Json {
    Json::String(base64::engine::general_purpose::STANDARD.encode(bytes))
}
