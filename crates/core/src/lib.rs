//! Seedling core types: managed objects, kinds, keys and errors.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

mod error;
mod kind;
mod resource;

pub use error::{ignore_not_found, Error, Result};
pub use kind::{Kind, SEEDLING_GROUP};
pub use resource::{ManagedResource, ObjectKey, OwnerRef};

pub const ANNOTATION_PREFIX: &str = "seedling.io/";
/// Payload fingerprint stamped on checksum-gated kinds.
pub const CHECKSUM_ANNOTATION: &str = "seedling.io/checksum";
/// Serialized desired state from the previous pass (three-way patch input).
pub const LAST_APPLIED_ANNOTATION: &str = "seedling.io/last-applied-configuration";
/// Blocks Project removal until every seed copy is gone.
pub const SEED_PROJECT_CLEANUP_FINALIZER: &str = "seedling.io/cleanup-seed-project";

/// How the engine decides whether a live object already matches the desired one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EqualityRule {
    /// Semantic deep equality of the whole object.
    Structural,
    /// Compare the checksum annotation against a checksum of the payload.
    Checksum,
    /// Compare last-applied annotations; send a three-way merge patch on change.
    ThreeWayPatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DeletePropagation {
    /// Dependents are removed before the owner disappears.
    Foreground,
    #[default]
    Background,
}

pub mod prelude {
    pub use super::{
        DeletePropagation, EqualityRule, Error, Kind, ManagedResource, ObjectKey, OwnerRef, Result,
        CHECKSUM_ANNOTATION, LAST_APPLIED_ANNOTATION, SEED_PROJECT_CLEANUP_FINALIZER,
    };
}
