//! In-memory storage: keeps the delivered state and an operation log.
//!
//! Used for embedding and tests. Failures and stalls can be injected to exercise retry and
//! backpressure paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use datawatch_core::{ResourceType, SyncAction, SyncEvent};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

use crate::client::{StorageClient, StorageError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredOp {
    pub resource: ResourceType,
    pub action: SyncAction,
    pub key: String,
}

pub struct MemoryStorage {
    state: Mutex<BTreeMap<(ResourceType, String), Value>>,
    log: Mutex<Vec<StoredOp>>,
    sweeps: Mutex<Vec<(ResourceType, i64)>>,
    calls: AtomicU32,
    transport_failures: AtomicU32,
    reject: AtomicBool,
    paused: watch::Sender<bool>,
}

impl Default for MemoryStorage {
    fn default() -> Self { Self::new() }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BTreeMap::new()),
            log: Mutex::new(Vec::new()),
            sweeps: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
            transport_failures: AtomicU32::new(0),
            reject: AtomicBool::new(false),
            paused: watch::channel(false).0,
        }
    }

    /// Fail the next `n` calls with a transport error.
    pub fn fail_transport(&self, n: u32) { self.transport_failures.store(n, Ordering::SeqCst); }

    /// Answer every call with `{"result": false}` until cleared.
    pub fn set_rejecting(&self, reject: bool) { self.reject.store(reject, Ordering::SeqCst); }

    /// Hold every call until `resume`.
    pub fn pause(&self) { self.paused.send_replace(true); }

    pub fn resume(&self) { self.paused.send_replace(false); }

    /// Successfully applied operations, in order.
    pub fn ops(&self) -> Vec<StoredOp> { self.log.lock().clone() }

    pub fn ops_for(&self, key: &str) -> Vec<StoredOp> { self.log.lock().iter().filter(|o| o.key == key).cloned().collect() }

    pub fn get(&self, resource: ResourceType, key: &str) -> Option<Value> {
        self.state.lock().get(&(resource, key.to_string())).cloned()
    }

    pub fn len(&self) -> usize { self.state.lock().len() }

    pub fn is_empty(&self) -> bool { self.state.lock().is_empty() }

    /// Every call made, failed ones included.
    pub fn calls(&self) -> u32 { self.calls.load(Ordering::SeqCst) }

    pub fn sweeps(&self) -> Vec<(ResourceType, i64)> { self.sweeps.lock().clone() }

    /// Poll until `n` operations are logged or `within` elapses; returns whether it got there.
    pub async fn wait_for_ops(&self, n: usize, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if self.log.lock().len() >= n {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn gate(&self) -> Result<(), StorageError> {
        let mut rx = self.paused.subscribe();
        let _ = rx.wait_for(|p| !*p).await;
        self.calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .transport_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::Transport("injected failure".into()));
        }
        if self.reject.load(Ordering::SeqCst) {
            return Err(StorageError::Rejected("injected rejection".into()));
        }
        Ok(())
    }

    fn record(&self, event: &SyncEvent) {
        self.log.lock().push(StoredOp { resource: event.resource, action: event.action, key: event.key() });
    }
}

#[async_trait]
impl StorageClient for MemoryStorage {
    async fn put(&self, event: &SyncEvent) -> Result<(), StorageError> {
        self.gate().await?;
        let v = serde_json::to_value(&event.item).map_err(|e| StorageError::Rejected(e.to_string()))?;
        self.state.lock().insert((event.resource, event.key()), v);
        self.record(event);
        Ok(())
    }

    async fn delete(&self, event: &SyncEvent) -> Result<(), StorageError> {
        self.gate().await?;
        self.state.lock().remove(&(event.resource, event.key()));
        self.record(event);
        Ok(())
    }

    async fn delete_stale(&self, resource: ResourceType, cutoff_unix: i64) -> Result<(), StorageError> {
        self.gate().await?;
        self.sweeps.lock().push((resource, cutoff_unix));
        Ok(())
    }
}
