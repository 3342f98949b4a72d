//! Delivery channels: one bounded queue and one consumer task per channel name.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use datawatch_core::{ResourceType, ShardPlanner, SyncAction, SyncEvent, WatchConfig};
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{StorageClient, StorageError};
use crate::sweep;
use crate::tasks::TaskCounter;

/// Outcome of handing an event to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    /// The queue stayed full for the whole enqueue timeout.
    Discarded,
    /// The consumer is gone.
    Closed,
}

pub struct DeliveryChannel {
    name: String,
    cluster: String,
    tx: mpsc::Sender<SyncEvent>,
    timeout: Duration,
    discarded: AtomicU64,
}

impl DeliveryChannel {
    pub fn name(&self) -> &str { &self.name }

    /// Queue `event`, waiting at most the enqueue timeout for room.
    pub async fn enqueue(&self, event: SyncEvent) -> Enqueue {
        match self.tx.send_timeout(event, self.timeout).await {
            Ok(()) => {
                gauge!("datawatch_queue_depth", self.depth() as f64, "cluster" => self.cluster.clone(), "channel" => self.name.clone());
                Enqueue::Queued
            }
            Err(SendTimeoutError::Timeout(ev)) => {
                let total = self.discarded.fetch_add(1, Ordering::Relaxed) + 1;
                counter!("datawatch_discarded_total", 1u64, "cluster" => self.cluster.clone(), "channel" => self.name.clone());
                warn!(channel = %self.name, key = %ev.key(), action = ev.action.as_str(), discarded = total, "queue full; event discarded");
                Enqueue::Discarded
            }
            Err(SendTimeoutError::Closed(ev)) => {
                debug!(channel = %self.name, key = %ev.key(), "channel closed");
                Enqueue::Closed
            }
        }
    }

    pub fn discarded(&self) -> u64 { self.discarded.load(Ordering::Relaxed) }

    /// Events waiting in the queue.
    pub fn depth(&self) -> usize { self.tx.max_capacity() - self.tx.capacity() }
}

pub struct DeliveryPipeline {
    channels: FxHashMap<String, Arc<DeliveryChannel>>,
    tasks: Vec<JoinHandle<()>>,
    live: TaskCounter,
}

impl DeliveryPipeline {
    /// Create every channel the config's planner can route to, their consumers and, when
    /// enabled, the per-resource dirty sweeps. Everything stops when `cancel` fires.
    pub fn start(cfg: &WatchConfig, storage: Arc<dyn StorageClient>, cancel: &CancellationToken) -> Self {
        let planner = cfg.planner();
        let mut channels = FxHashMap::default();
        let mut tasks = Vec::new();
        let live = TaskCounter::new();
        for rt in ResourceType::ALL {
            for shard in planner.channels(rt) {
                let name = shard.channel_name();
                let (tx, rx) = mpsc::channel(cfg.queue_capacity_for(rt));
                tasks.push(spawn_consumer(&live, name.clone(), cfg.cluster_id.clone(), rx, storage.clone(), cancel.child_token()));
                channels.insert(
                    name.clone(),
                    Arc::new(DeliveryChannel {
                        name,
                        cluster: cfg.cluster_id.clone(),
                        tx,
                        timeout: cfg.enqueue_timeout(),
                        discarded: AtomicU64::new(0),
                    }),
                );
            }
        }
        if cfg.sweep_enabled {
            tasks.extend(sweep::spawn_sweeps(cfg, storage, cancel, &live));
        }
        info!(cluster = %cfg.cluster_id, channels = channels.len(), "delivery pipeline started");
        Self { channels, tasks, live }
    }

    /// Counter of consumer and sweep tasks; stays valid after `shutdown`.
    pub fn task_counter(&self) -> TaskCounter { self.live.clone() }

    pub fn channels(&self) -> &FxHashMap<String, Arc<DeliveryChannel>> { &self.channels }

    pub fn channel(&self, name: &str) -> Option<Arc<DeliveryChannel>> { self.channels.get(name).cloned() }

    /// Wait for every consumer and sweep task; call after cancelling the token given to `start`.
    pub async fn shutdown(self) {
        drop(self.channels);
        for t in self.tasks {
            let _ = t.await;
        }
    }
}

fn spawn_consumer(
    live: &TaskCounter,
    name: String,
    cluster: String,
    mut rx: mpsc::Receiver<SyncEvent>,
    storage: Arc<dyn StorageClient>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    live.spawn(async move {
        loop {
            let ev = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                maybe = rx.recv() => match maybe {
                    Some(ev) => ev,
                    None => {
                        debug!(channel = %name, "channel closed; consumer exiting");
                        break;
                    }
                },
            };
            gauge!("datawatch_queue_depth", rx.len() as f64, "cluster" => cluster.clone(), "channel" => name.clone());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = deliver(&*storage, &cluster, &name, &ev) => {}
            }
        }
        info!(channel = %name, "consumer stopped");
    })
}

async fn call(storage: &dyn StorageClient, ev: &SyncEvent) -> Result<(), StorageError> {
    match ev.action {
        SyncAction::Add | SyncAction::Update => storage.put(ev).await,
        SyncAction::Delete => storage.delete(ev).await,
    }
}

/// Deliver one event; a transport failure gets exactly one more attempt.
pub async fn deliver(storage: &dyn StorageClient, cluster: &str, channel: &str, ev: &SyncEvent) -> bool {
    let mut res = call(storage, ev).await;
    if let Err(e) = &res {
        if e.is_retryable() {
            warn!(channel = %channel, key = %ev.key(), error = %e, "delivery failed; retrying once");
            res = call(storage, ev).await;
        }
    }
    let status = if res.is_ok() { "ok" } else { "failed" };
    counter!(
        "datawatch_sync_total",
        1u64,
        "cluster" => cluster.to_string(),
        "resource" => ev.resource.as_str(),
        "action" => ev.action.as_str(),
        "status" => status
    );
    match res {
        Ok(()) => {
            debug!(channel = %channel, key = %ev.key(), action = ev.action.as_str(), "delivered");
            true
        }
        Err(e) => {
            error!(channel = %channel, resource = %ev.resource, key = %ev.key(), action = ev.action.as_str(), error = %e, "event dropped");
            false
        }
    }
}
