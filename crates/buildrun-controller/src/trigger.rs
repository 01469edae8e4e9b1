//! Deferred-resolution index.
//!
//! Builds whose output or strategy image stream cannot be resolved yet
//! register here under the stream's key. When the stream shows up or changes, every
//! waiting build is handed back to the work queue once.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

use buildrun_core::ObjectKey;

#[derive(Default)]
pub struct ResourceTriggerIndex {
    waiting: Mutex<HashMap<ObjectKey, BTreeSet<ObjectKey>>>,
}

impl ResourceTriggerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember that `resource` must be retried when `on` changes.
    pub fn add(&self, resource: ObjectKey, on: ObjectKey) {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(on)
            .or_default()
            .insert(resource);
    }

    /// `resource` no longer waits for `on`.
    pub fn remove(&self, resource: &ObjectKey, on: &ObjectKey) {
        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(resources) = waiting.get_mut(on) {
            resources.remove(resource);
            if resources.is_empty() {
                waiting.remove(on);
            }
        }
    }

    /// Drop `resource` from everything it waits on.
    pub fn forget(&self, resource: &ObjectKey) {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, resources| {
                resources.remove(resource);
                !resources.is_empty()
            });
    }

    /// Take every resource waiting on `on`, clearing the entry.
    pub fn pop(&self, on: &ObjectKey) -> Vec<ObjectKey> {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(on)
            .map(|resources| resources.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn is_waiting(&self, resource: &ObjectKey, on: &ObjectKey) -> bool {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(on)
            .is_some_and(|resources| resources.contains(resource))
    }
}
