//! Informer-backed source: a kube watch stream feeding a local lister map.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use datawatch_core::{entity_key, SyncEntity};
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Resource, ResourceExt};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Change, Source, SourceError};

const INITIAL_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

type Lister<T> = Arc<RwLock<FxHashMap<String, T>>>;
type Nudge<T> = Arc<Mutex<Option<mpsc::Sender<Change<T>>>>>;

pub struct InformerSource<T> {
    name: String,
    lister: Lister<T>,
    ready: watch::Receiver<bool>,
    nudge: Nudge<T>,
    sync_timeout: Duration,
}

impl<T: SyncEntity> InformerSource<T> {
    /// Spawn the watch stream for `api`; objects that `convert` rejects are not listed.
    pub fn start<K>(name: &str, api: Api<K>, convert: fn(&K) -> Option<T>, cancel: CancellationToken) -> Self
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    {
        let lister: Lister<T> = Arc::new(RwLock::new(FxHashMap::default()));
        let nudge: Nudge<T> = Arc::new(Mutex::new(None));
        let (ready_tx, ready) = watch::channel(false);
        let (l, n, label) = (lister.clone(), nudge.clone(), name.to_string());
        tokio::spawn(async move {
            let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
            futures::pin_mut!(stream);
            info!(informer = %label, "informer started");
            loop {
                let ev = tokio::select! {
                    _ = cancel.cancelled() => break,
                    ev = stream.next() => ev,
                };
                match ev {
                    Some(Ok(Event::Applied(o))) => match convert(&o) {
                        Some(item) => {
                            l.write().insert(key_of(&o), item);
                        }
                        None => {
                            l.write().remove(&key_of(&o));
                        }
                    },
                    Some(Ok(Event::Deleted(o))) => {
                        l.write().remove(&key_of(&o));
                    }
                    Some(Ok(Event::Restarted(list))) => {
                        debug!(informer = %label, count = list.len(), "watch restart");
                        let next: FxHashMap<String, T> =
                            list.iter().filter_map(|o| convert(o).map(|item| (key_of(o), item))).collect();
                        *l.write() = next;
                        let _ = ready_tx.send(true);
                    }
                    Some(Err(e)) => {
                        warn!(informer = %label, error = %e, "watch error");
                        continue;
                    }
                    None => {
                        warn!(informer = %label, "watch stream ended");
                        break;
                    }
                }
                // Capacity one: a pending resync already covers this change.
                if let Some(tx) = n.lock().as_ref() {
                    let _ = tx.try_send(Change::Resync);
                }
            }
            info!(informer = %label, "informer stopped");
        });
        Self { name: name.to_string(), lister, ready, nudge, sync_timeout: INITIAL_SYNC_TIMEOUT }
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }
}

fn key_of<K: Resource>(o: &K) -> String { entity_key(&o.namespace().unwrap_or_default(), &o.name_any()) }

#[async_trait]
impl<T: SyncEntity> Source<T> for InformerSource<T> {
    fn describe(&self) -> String { format!("informer:{}", self.name) }

    async fn list(&self) -> Result<Vec<T>, SourceError> {
        let mut ready = self.ready.clone();
        let synced = tokio::time::timeout(self.sync_timeout, ready.wait_for(|r| *r))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        if !synced {
            return Err(SourceError::NotReady);
        }
        Ok(self.lister.read().values().cloned().collect())
    }

    fn watch(&self, _cancel: CancellationToken) -> Option<mpsc::Receiver<Change<T>>> {
        let (tx, rx) = mpsc::channel(1);
        *self.nudge.lock() = Some(tx);
        Some(rx)
    }
}
