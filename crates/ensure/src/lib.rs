//! Seedling ensure: the declarative create/compare/update loop.
//!
//! A `KindEntry` pairs a kind's comparison rule with named creators;
//! `ResourceEnsurer::ensure_kind` converges them against a `ResourceStore`.
//! `ClusterReconciler` runs the fixed component pipeline for a Cluster.

#![forbid(unsafe_code)]

mod cluster;
mod ensurer;
mod kinds;
mod template;

pub use cluster::{ClusterReconciler, ComponentSet};
pub use ensurer::{count_write, EnsureReport, ResourceEnsurer, WaitConfig};
pub use kinds::{Creator, KindEntry, KindSpec, NamedCreator, Stage, SELECTOR_MATCH_LABELS};
pub use template::{cluster_namespace, Datacenter, StaticTemplateDataProvider, TemplateData, TemplateDataProvider, TemplateSettings};
