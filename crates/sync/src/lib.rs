//! Seedling sync: multi-seed Project replication.
//!
//! `ProjectSynchronizer` fans each control-plane Project out to every seed
//! in the current `SeedRegistry` snapshot and holds deletion behind the
//! cleanup finalizer until every seed copy is gone.

#![forbid(unsafe_code)]

mod project;
mod registry;

pub use project::{enqueue_all_projects, seed_project, ProjectSynchronizer, CONTROLLER_NAME};
pub use registry::{RegistryHandle, SeedRegistry, SeedTopology};
