//! Build pod construction and Kubernetes backends for buildrun.
//!
//! Provides:
//! - Strategy builders that turn a Build into a pod spec
//! - The defaults/overrides admission extension
//! - kube-backed build, pod and event clients
//! - Informers that keep the object caches current

pub mod admission;
pub mod error;
pub mod informer;
pub mod kubernetes;
pub mod strategy;

pub use admission::BuildAdmission;
pub use error::StrategyError;
pub use informer::{IgnoreEvents, ResourceHandler, run_informer};
pub use kubernetes::{KubernetesClient, crds};
pub use strategy::{BuildPodFactory, BuildPodStrategy};
