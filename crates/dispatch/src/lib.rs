//! Seedling dispatch: work queue, worker pool and watch routing.
//!
//! Keys flow watch → `EventWatchDispatcher` → `WorkQueue` → `Dispatcher`
//! workers → `Reconciler`. Per key there is at most one reconcile in flight;
//! failures are retried with per-key exponential backoff.

#![forbid(unsafe_code)]

mod controller;
mod queue;
mod watch;

pub use controller::{Action, Dispatcher, DispatcherConfig, Reconciler};
pub use queue::{Backoff, WorkQueue};
pub use watch::EventWatchDispatcher;
