//! Collaborator traits consumed by the build controller.
//!
//! Caches are synchronous, eventually consistent read views; clients talk to
//! the authoritative store.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;

use crate::{Build, Result};

/// Read-only view of a locally replicated collection of objects.
pub trait Lister<K>: Send + Sync {
    /// Get an object by namespace and name.
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>>;

    /// List objects in a namespace whose labels contain every pair in `selector`.
    fn list(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Vec<Arc<K>>;

    /// Whether the initial list has been loaded.
    fn has_synced(&self) -> bool;
}

/// Writes to builds in the authoritative store.
#[async_trait]
pub trait BuildClient: Send + Sync {
    /// Apply a JSON merge patch and return the updated build.
    async fn patch(&self, namespace: &str, name: &str, patch: &serde_json::Value)
        -> Result<Build>;
}

/// Pod operations against the authoritative store.
#[async_trait]
pub trait PodClient: Send + Sync {
    /// Create a pod. Fails with `Error::AlreadyExists` when the name is taken.
    async fn create(&self, namespace: &str, pod: &Pod) -> Result<Pod>;

    /// Fetch a pod directly, bypassing any cache.
    async fn get(&self, namespace: &str, name: &str) -> Result<Pod>;

    /// Delete a pod. Fails with `Error::NotFound` when it is already gone.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// Records human readable events against a build. Recording is best-effort:
/// failures are logged by the implementation and never surface.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn event(&self, build: &Build, event_type: EventType, reason: &str, message: String);
}

/// Admission extension invoked on every build pod before it is created.
pub trait PodAdmission: Send + Sync {
    /// Fill in cluster-wide defaults the pod does not already set.
    fn apply_defaults(&self, pod: &mut Pod) -> Result<()>;

    /// Force cluster-wide settings, replacing whatever the pod set.
    fn apply_overrides(&self, pod: &mut Pod) -> Result<()>;
}
