//! Build lifecycle reconciliation for buildrun.
//!
//! Watches builds and their pods, drives every build through its phases
//! and resolves output image streams before a build pod is created.
//! A deduplicating, rate-limited work queue feeds a fixed pool of workers.

pub mod completion;
pub mod controller;
pub mod phase;
pub mod policy;
pub mod queue;
pub mod resolve;
pub mod trigger;
pub mod update;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use completion::CompletionNotifier;
pub use controller::{BuildController, BuildControllerParams};
pub use policy::RunPolicies;
pub use queue::{RateLimiter, WorkQueue};
pub use trigger::ResourceTriggerIndex;
pub use update::BuildUpdate;
pub use worker::{Worker, run_workers};
