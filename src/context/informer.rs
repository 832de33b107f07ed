//! List-and-watch informers.
//!
//! An informer keeps an eventually-consistent local mirror of one cluster
//! resource kind. A pump task performs a full list, replaces the store, then
//! consumes the watch stream until it closes or errors, at which point it
//! re-lists with backoff. Observations are forwarded to an optional callback;
//! the cluster context uses this to collapse transient submitted-pods
//! entries.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::cluster::api::ObjectEvent;
use crate::error::Result;

const INITIAL_RELIST_BACKOFF: Duration = Duration::from_millis(500);
const MAX_RELIST_BACKOFF: Duration = Duration::from_secs(30);

/// Source of truth an informer mirrors: one full list plus a watch stream
/// resuming from the listed resource version.
#[async_trait::async_trait]
pub trait WatchSource<K: Send + Sync + 'static>: Send + Sync + 'static {
    async fn list(&self) -> Result<(Vec<K>, String)>;

    async fn watch(
        &self,
        resource_version: &str,
    ) -> Result<futures::stream::BoxStream<'static, Result<ObjectEvent<K>>>>;

    /// Store key for one object (pod or node name).
    fn key(&self, object: &K) -> String;
}

pub type EventCallback<K> = Arc<dyn Fn(&ObjectEvent<K>) + Send + Sync>;

pub struct Informer<K> {
    store: Arc<RwLock<HashMap<String, K>>>,
    stop: CancellationToken,
}

impl<K: Clone + Send + Sync + 'static> Informer<K> {
    /// Start the pump. The informer runs until [`Informer::stop`] is called.
    pub fn start<S: WatchSource<K>>(source: S, on_event: Option<EventCallback<K>>) -> Self {
        let store = Arc::new(RwLock::new(HashMap::new()));
        let stop = CancellationToken::new();

        let pump_store = store.clone();
        let pump_stop = stop.clone();
        tokio::spawn(async move {
            pump(source, pump_store, on_event, pump_stop).await;
        });

        Self { store, stop }
    }

    /// Snapshot of the mirrored objects.
    pub fn snapshot(&self) -> Vec<K> {
        self.store.read().unwrap().values().cloned().collect()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }
}

async fn pump<K, S>(
    source: S,
    store: Arc<RwLock<HashMap<String, K>>>,
    on_event: Option<EventCallback<K>>,
    stop: CancellationToken,
) where
    K: Clone + Send + Sync + 'static,
    S: WatchSource<K>,
{
    let mut backoff = INITIAL_RELIST_BACKOFF;

    while !stop.is_cancelled() {
        let (items, resource_version) = match source.list().await {
            Ok(listed) => listed,
            Err(e) => {
                tracing::warn!(error = %e, "Informer list failed");
                if wait_backoff(&stop, &mut backoff).await {
                    break;
                }
                continue;
            }
        };

        {
            let mut objects = store.write().unwrap();
            objects.clear();
            for item in &items {
                objects.insert(source.key(item), item.clone());
            }
        }
        // Re-listed objects count as observations, so transient state keyed
        // off watch events stays consistent across reconnects.
        if let Some(callback) = on_event.as_ref() {
            for item in items {
                callback(&ObjectEvent::Applied(item));
            }
        }
        backoff = INITIAL_RELIST_BACKOFF;

        let mut stream = match source.watch(&resource_version).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "Informer watch failed to open");
                if wait_backoff(&stop, &mut backoff).await {
                    break;
                }
                continue;
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return,
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        apply(&source, &store, &event);
                        if let Some(callback) = on_event.as_ref() {
                            callback(&event);
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Informer watch error, re-listing");
                        break;
                    }
                    None => {
                        tracing::debug!("Informer watch closed, re-listing");
                        break;
                    }
                },
            }
        }

        if wait_backoff(&stop, &mut backoff).await {
            break;
        }
    }
}

fn apply<K, S>(source: &S, store: &Arc<RwLock<HashMap<String, K>>>, event: &ObjectEvent<K>)
where
    K: Clone + Send + Sync + 'static,
    S: WatchSource<K>,
{
    let mut objects = store.write().unwrap();
    match event {
        ObjectEvent::Applied(object) => {
            objects.insert(source.key(object), object.clone());
        }
        ObjectEvent::Deleted(object) => {
            objects.remove(&source.key(object));
        }
    }
}

/// Sleep for the current backoff, doubling it for next time. Returns true if
/// shutdown fired during the wait.
async fn wait_backoff(stop: &CancellationToken, backoff: &mut Duration) -> bool {
    let stopped = tokio::select! {
        biased;
        _ = stop.cancelled() => true,
        _ = tokio::time::sleep(*backoff) => false,
    };
    *backoff = (*backoff * 2).min(MAX_RELIST_BACKOFF);
    stopped
}
