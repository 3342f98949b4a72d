//! Per-resource watch loop: periodic full passes plus pushed changes from the source.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use datawatch_core::{ResourceTiming, SyncEntity, SyncEvent};
use datawatch_kubehub::{Change, Source, SourceError};
use datawatch_store::EventSink;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::reconcile::Reconciler;

pub struct ResourceWatcher<T: SyncEntity> {
    cluster: String,
    source: Arc<dyn Source<T>>,
    sink: Arc<dyn EventSink>,
    reconciler: Reconciler<T>,
    tick: Duration,
}

enum Step<T> {
    Stop,
    Tick,
    Push(Option<Change<T>>),
}

async fn next_change<T>(rx: &mut Option<mpsc::Receiver<Change<T>>>) -> Option<Change<T>> {
    match rx {
        Some(r) => r.recv().await,
        None => std::future::pending().await,
    }
}

impl<T: SyncEntity> ResourceWatcher<T> {
    pub fn new(cluster: &str, source: Arc<dyn Source<T>>, sink: Arc<dyn EventSink>, timing: ResourceTiming) -> Self {
        Self {
            cluster: cluster.to_string(),
            source,
            sink,
            reconciler: Reconciler::new(timing.stale_after()),
            tick: timing.tick(),
        }
    }

    pub fn reconciler(&self) -> &Reconciler<T> { &self.reconciler }

    /// List the source and forward the diff. Returns the number of events emitted.
    pub async fn reconcile_once(&mut self) -> Result<usize, SourceError> {
        let started = std::time::Instant::now();
        let items = self.source.list().await?;
        let listed = items.len();
        let events = self.reconciler.reconcile(items, Instant::now());
        let n = events.len();
        self.emit(events).await;
        debug!(resource = %T::RESOURCE, listed, events = n, took_ms = %started.elapsed().as_millis(), "reconciled");
        Ok(n)
    }

    async fn emit(&self, events: Vec<SyncEvent>) {
        for ev in events {
            counter!(
                "datawatch_reconcile_events_total",
                1u64,
                "cluster" => self.cluster.clone(),
                "resource" => ev.resource.as_str(),
                "action" => ev.action.as_str()
            );
            self.sink.submit(ev).await;
        }
    }

    /// Tick and push loop until `cancel` fires; the cache is emptied on the way out.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut push = self.source.watch(cancel.child_token());
        let mut ticker = interval_at(Instant::now() + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(resource = %T::RESOURCE, source = %self.source.describe(), tick_s = self.tick.as_secs(), "watcher started");
        loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => Step::Stop,
                _ = ticker.tick() => Step::Tick,
                c = next_change(&mut push) => Step::Push(c),
            };
            match step {
                Step::Stop => break,
                Step::Tick | Step::Push(Some(Change::Resync)) => {
                    if let Err(e) = self.reconcile_once().await {
                        warn!(resource = %T::RESOURCE, error = %e, "list failed; retrying next tick");
                    }
                }
                Step::Push(Some(change)) => {
                    let events = self.reconciler.apply(change, Instant::now());
                    self.emit(events).await;
                }
                Step::Push(None) => {
                    debug!(resource = %T::RESOURCE, "push channel closed; ticks only");
                    push = None;
                }
            }
        }
        self.reconciler.clear();
        info!(resource = %T::RESOURCE, "watcher stopped");
    }
}

/// Forwards every event to `primary` and a copy to `tap`.
pub struct TeeSink {
    primary: Arc<dyn EventSink>,
    tap: mpsc::Sender<SyncEvent>,
}

impl TeeSink {
    pub fn new(primary: Arc<dyn EventSink>, tap: mpsc::Sender<SyncEvent>) -> Self { Self { primary, tap } }
}

#[async_trait]
impl EventSink for TeeSink {
    async fn submit(&self, event: SyncEvent) {
        let copy = event.clone();
        self.primary.submit(event).await;
        let _ = self.tap.send(copy).await;
    }
}
