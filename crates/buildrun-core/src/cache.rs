//! In-memory object cache.
//!
//! Informers write into an `ObjectCache`; the controller only reads from it
//! through the `Lister` trait. Objects are stored behind `Arc` and replaced
//! wholesale, so readers always see a consistent snapshot of one object.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use kube::{Resource, ResourceExt};

use crate::ObjectKey;
use crate::client::Lister;

pub struct ObjectCache<K> {
    objects: RwLock<HashMap<ObjectKey, Arc<K>>>,
    synced: AtomicBool,
}

impl<K> Default for ObjectCache<K> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            synced: AtomicBool::new(false),
        }
    }
}

impl<K> ObjectCache<K>
where
    K: Resource + Send + Sync,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an object, returning the previous version.
    pub fn apply(&self, obj: K) -> (Arc<K>, Option<Arc<K>>) {
        let key = ObjectKey::of(&obj);
        let obj = Arc::new(obj);
        let old = self
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, obj.clone());
        (obj, old)
    }

    /// Remove an object, returning the cached version if there was one.
    pub fn remove(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Drop every object whose key is not in `keep`. Used after a relist.
    pub fn retain_keys(&self, keep: &HashSet<ObjectKey>) -> Vec<Arc<K>> {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let stale: Vec<ObjectKey> = objects
            .keys()
            .filter(|key| !keep.contains(*key))
            .cloned()
            .collect();
        stale.iter().filter_map(|key| objects.remove(key)).collect()
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Lister<K> for ObjectCache<K>
where
    K: Resource + Send + Sync,
{
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ObjectKey::new(namespace, name))
            .cloned()
    }

    fn list(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Vec<Arc<K>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(key, _)| key.namespace == namespace)
            .filter(|(_, obj)| {
                let labels = obj.labels();
                selector.iter().all(|(k, v)| labels.get(k) == Some(v))
            })
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}
