//! Informers: watch a resource kind and mirror it into an `ObjectCache`.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

use buildrun_core::client::Lister;
use buildrun_core::{ObjectCache, ObjectKey};
use futures::StreamExt;
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

/// Receives cache changes after they have been applied.
pub trait ResourceHandler<K>: Send + Sync {
    /// An object was added (`old` is `None`) or replaced.
    fn on_apply(&self, _old: Option<Arc<K>>, _new: Arc<K>) {}

    /// An object disappeared, either by a delete event or a relist.
    fn on_delete(&self, _obj: Arc<K>) {}
}

/// Handler for caches nobody reacts to.
pub struct IgnoreEvents;

impl<K> ResourceHandler<K> for IgnoreEvents {}

/// Watch `api` forever, keeping `cache` current and notifying `handler`.
///
/// The cache is marked synced once the first full list has been applied.
/// Watch failures are retried with backoff.
pub async fn run_informer<K>(
    api: Api<K>,
    cache: Arc<ObjectCache<K>>,
    handler: Arc<dyn ResourceHandler<K>>,
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let kind = K::kind(&()).to_string();
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    let mut stream = std::pin::pin!(stream);

    // Keys seen during the current (re)list.
    let mut listed: Option<HashSet<ObjectKey>> = None;

    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Init) => {
                debug!(%kind, "Listing");
                listed = Some(HashSet::new());
            }
            Ok(Event::InitApply(obj)) => {
                if let Some(seen) = listed.as_mut() {
                    seen.insert(ObjectKey::of(&obj));
                }
                let (new, old) = cache.apply(obj);
                handler.on_apply(old, new);
            }
            Ok(Event::InitDone) => {
                if let Some(seen) = listed.take() {
                    for gone in cache.retain_keys(&seen) {
                        handler.on_delete(gone);
                    }
                }
                if !cache.has_synced() {
                    info!(%kind, objects = cache.len(), "Cache synced");
                }
                cache.mark_synced();
            }
            Ok(Event::Apply(obj)) => {
                let (new, old) = cache.apply(obj);
                handler.on_apply(old, new);
            }
            Ok(Event::Delete(obj)) => {
                let key = ObjectKey::of(&obj);
                let gone = cache.remove(&key).unwrap_or_else(|| Arc::new(obj));
                handler.on_delete(gone);
            }
            Err(e) => {
                warn!(%kind, error = %e, "Watch failed, will retry");
            }
        }
    }
}
