//! Seedling store: the object store contract the engine reconciles against,
//! and an in-memory backend whose cache lags behind its writes.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use seedling_core::{DeletePropagation, Kind, ManagedResource, ObjectKey, Result};

pub mod cache;
mod memory;
mod recorder;

pub use cache::{spawn_cache_ingest, CacheHandle, CacheSnapshot, Coalescer, Delta, DeltaKind};
pub use memory::{FailureRule, MemoryStore, WriteRecord};
pub use recorder::{MemoryRecorder, RecordedEvent};

/// Object store for one cluster.
///
/// `get`/`list` read a watch-fed cache and may be stale; everything async
/// talks to the live API and observes its own writes.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    fn get(&self, kind: Kind, key: &ObjectKey) -> Result<ManagedResource>;
    fn list(&self, kind: Kind, namespace: Option<&str>) -> Result<Vec<ManagedResource>>;

    /// Live read, bypassing the cache.
    async fn fetch(&self, kind: Kind, key: &ObjectKey) -> Result<ManagedResource>;
    async fn create(&self, obj: &ManagedResource) -> Result<ManagedResource>;
    /// Full replace. A set resourceVersion must match the live one.
    async fn update(&self, obj: &ManagedResource) -> Result<ManagedResource>;
    /// RFC 7386 merge patch against the main resource.
    async fn patch(&self, kind: Kind, key: &ObjectKey, patch: &Json) -> Result<ManagedResource>;
    /// Merge patch against the status subresource; `patch` has the `{"status": ...}` shape.
    async fn patch_status(&self, kind: Kind, key: &ObjectKey, patch: &Json) -> Result<ManagedResource>;
    async fn delete(&self, kind: Kind, key: &ObjectKey, propagation: DeletePropagation) -> Result<()>;
}

/// Emits events attached to an object. Best effort: failures are logged, never returned.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn warning(&self, obj: &ManagedResource, reason: &str, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    Create,
    Update,
    Patch,
    PatchStatus,
    Delete,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Patch => "patch",
            Verb::PatchStatus => "patch_status",
            Verb::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}
