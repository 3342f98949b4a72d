//! In-memory source: a keyed set of entities that can be edited and can push changes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use datawatch_core::SyncEntity;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Change, Source, SourceError};

pub struct MemSource<T> {
    items: Mutex<BTreeMap<String, T>>,
    failing: AtomicBool,
    push: Mutex<Option<mpsc::Sender<Change<T>>>>,
}

impl<T: SyncEntity> Default for MemSource<T> {
    fn default() -> Self { Self::new() }
}

impl<T: SyncEntity> MemSource<T> {
    pub fn new() -> Self { Self { items: Mutex::new(BTreeMap::new()), failing: AtomicBool::new(false), push: Mutex::new(None) } }

    pub fn with_items(items: impl IntoIterator<Item = T>) -> Self {
        let s = Self::new();
        for i in items {
            s.set(i);
        }
        s
    }

    /// Insert or replace without notifying; the next listing sees it.
    pub fn set(&self, item: T) { self.items.lock().insert(item.key(), item); }

    pub fn remove(&self, key: &str) -> Option<T> { self.items.lock().remove(key) }

    /// Make `list` fail with `NotReady` until cleared.
    pub fn set_failing(&self, failing: bool) { self.failing.store(failing, Ordering::SeqCst); }

    /// Deliver `change` to the active watch, if any. Returns false when nobody listens.
    pub async fn push(&self, change: Change<T>) -> bool {
        let tx = self.push.lock().clone();
        match tx {
            Some(tx) => tx.send(change).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl<T: SyncEntity> Source<T> for MemSource<T> {
    fn describe(&self) -> String { format!("memory:{}", T::RESOURCE) }

    async fn list(&self) -> Result<Vec<T>, SourceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SourceError::NotReady);
        }
        Ok(self.items.lock().values().cloned().collect())
    }

    /// Replaces any earlier watch; the previous receiver observes closure.
    fn watch(&self, _cancel: CancellationToken) -> Option<mpsc::Receiver<Change<T>>> {
        let (tx, rx) = mpsc::channel(64);
        *self.push.lock() = Some(tx);
        Some(rx)
    }
}
