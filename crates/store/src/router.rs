//! Event router: maps each event to its delivery channel through the shard planner.

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use datawatch_core::{ShardPlanner, SyncEvent};
use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::error;

use crate::pipeline::{DeliveryChannel, DeliveryPipeline, Enqueue};

/// Anything watchers can hand their events to.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn submit(&self, event: SyncEvent);
}

type Table = FxHashMap<String, Arc<DeliveryChannel>>;

pub struct EventRouter {
    cluster: String,
    planner: Arc<dyn ShardPlanner>,
    table: ArcSwap<Table>,
}

impl EventRouter {
    pub fn new(cluster: &str, planner: Arc<dyn ShardPlanner>) -> Self {
        Self { cluster: cluster.to_string(), planner, table: ArcSwap::from_pointee(Table::default()) }
    }

    /// Router publishing every channel of `pipeline`.
    pub fn for_pipeline(cluster: &str, planner: Arc<dyn ShardPlanner>, pipeline: &DeliveryPipeline) -> Self {
        let r = Self::new(cluster, planner);
        r.publish(pipeline.channels().clone());
        r
    }

    /// Swap in a new channel table; in-flight dispatches finish against the old one.
    pub fn publish(&self, channels: Table) { self.table.store(Arc::new(channels)); }

    /// Channel name for `event`.
    pub fn route(&self, event: &SyncEvent) -> String { self.planner.plan(event.resource, &event.key()).channel_name() }

    /// Enqueue `event` on its channel. `None` when no such channel is registered.
    pub async fn dispatch(&self, event: SyncEvent) -> Option<Enqueue> {
        let name = self.route(&event);
        let channel = self.table.load().get(&name).cloned();
        match channel {
            Some(ch) => Some(ch.enqueue(event).await),
            None => {
                counter!("datawatch_unrouted_total", 1u64, "cluster" => self.cluster.clone(), "channel" => name.clone());
                error!(channel = %name, resource = %event.resource, key = %event.key(), "no delivery channel; event dropped");
                None
            }
        }
    }
}

#[async_trait]
impl EventSink for EventRouter {
    async fn submit(&self, event: SyncEvent) { let _ = self.dispatch(event).await; }
}
