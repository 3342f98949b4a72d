//! Explicit runtime configuration handed to every watcher, channel and sweep.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::entity::ResourceType;
use crate::error::CoreError;
use crate::shard::ModuloKeyPlanner;

/// Tick, staleness and sweep periods of one resource type, in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTiming {
    pub tick_secs: u64,
    pub stale_secs: u64,
    pub sweep_secs: u64,
}

impl ResourceTiming {
    pub fn defaults_for(resource: ResourceType) -> Self {
        let (tick_secs, stale_secs) = match resource {
            ResourceType::Application | ResourceType::TaskGroup => (8, 180),
            ResourceType::Deployment => (8, 240),
            ResourceType::Service | ResourceType::Endpoint => (10, 120),
            ResourceType::ConfigMap | ResourceType::Secret => (10, 300),
            ResourceType::ExportService => (30, 360),
            ResourceType::IpPool => (240, 360),
        };
        let sweep_secs = if resource.is_sharded() { 120 } else { 300 };
        Self { tick_secs, stale_secs, sweep_secs }
    }

    pub fn tick(&self) -> Duration { Duration::from_secs(self.tick_secs) }
    pub fn stale_after(&self) -> Duration { Duration::from_secs(self.stale_secs) }
    pub fn sweep_every(&self) -> Duration { Duration::from_secs(self.sweep_secs) }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WatchConfig {
    pub cluster_id: String,
    pub application_threads: usize,
    pub taskgroup_threads: usize,
    pub exportservice_threads: usize,
    pub deployment_threads: usize,
    /// Queue capacity of each sharded channel.
    pub sharded_queue_capacity: usize,
    /// Queue capacity of singleton channels.
    pub queue_capacity: usize,
    pub enqueue_timeout_ms: u64,
    /// Remote entries older than this are removed by the dirty sweep.
    pub sweep_ttl_secs: u64,
    pub sweep_enabled: bool,
    pub timings: BTreeMap<ResourceType, ResourceTiming>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            cluster_id: String::new(),
            application_threads: 10,
            taskgroup_threads: 10,
            exportservice_threads: 10,
            deployment_threads: 10,
            sharded_queue_capacity: 10_240,
            queue_capacity: 1_024,
            enqueue_timeout_ms: 1_000,
            sweep_ttl_secs: 600,
            sweep_enabled: true,
            timings: BTreeMap::new(),
        }
    }
}

impl WatchConfig {
    pub fn new(cluster_id: &str) -> Self { Self { cluster_id: cluster_id.to_string(), ..Default::default() } }

    pub fn timing(&self, resource: ResourceType) -> ResourceTiming {
        self.timings.get(&resource).copied().unwrap_or_else(|| ResourceTiming::defaults_for(resource))
    }

    pub fn shard_count(&self, resource: ResourceType) -> usize {
        match resource {
            ResourceType::Application => self.application_threads,
            ResourceType::TaskGroup => self.taskgroup_threads,
            ResourceType::ExportService => self.exportservice_threads,
            ResourceType::Deployment => self.deployment_threads,
            _ => 1,
        }
    }

    pub fn queue_capacity_for(&self, resource: ResourceType) -> usize {
        if resource.is_sharded() { self.sharded_queue_capacity } else { self.queue_capacity }
    }

    pub fn enqueue_timeout(&self) -> Duration { Duration::from_millis(self.enqueue_timeout_ms) }

    pub fn sweep_ttl(&self) -> Duration { Duration::from_secs(self.sweep_ttl_secs) }

    pub fn planner(&self) -> ModuloKeyPlanner {
        ResourceType::ALL
            .iter()
            .filter(|rt| rt.is_sharded())
            .fold(ModuloKeyPlanner::new(), |p, rt| p.with_buckets(*rt, self.shard_count(*rt)))
    }

    /// Reject configurations the pipeline cannot run correctly with.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.cluster_id.trim().is_empty() {
            return Err(CoreError::Config("cluster id must not be empty".into()));
        }
        for rt in ResourceType::ALL {
            if rt.is_sharded() && self.shard_count(rt) == 0 {
                return Err(CoreError::Config(format!("{} thread count must be at least 1", rt)));
            }
            if rt.is_sharded() && self.shard_count(rt) > u16::MAX as usize {
                return Err(CoreError::Config(format!("{} thread count exceeds {}", rt, u16::MAX)));
            }
            let t = self.timing(rt);
            if t.tick_secs == 0 || t.sweep_secs == 0 {
                return Err(CoreError::Config(format!("{} tick and sweep periods must be positive", rt)));
            }
            if self.sweep_enabled && t.stale_secs >= self.sweep_ttl_secs {
                return Err(CoreError::Config(format!(
                    "{} staleness threshold {}s must stay below sweep ttl {}s",
                    rt, t.stale_secs, self.sweep_ttl_secs
                )));
            }
        }
        if self.queue_capacity == 0 || self.sharded_queue_capacity == 0 {
            return Err(CoreError::Config("queue capacities must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ShardPlanner;

    #[test]
    fn defaults_validate() {
        WatchConfig::new("BCS-K8S-00001").validate().unwrap();
    }

    #[test]
    fn empty_cluster_is_rejected() {
        assert!(WatchConfig::default().validate().is_err());
    }

    #[test]
    fn staleness_must_stay_below_sweep_ttl() {
        let mut cfg = WatchConfig::new("c");
        cfg.timings.insert(ResourceType::Secret, ResourceTiming { tick_secs: 10, stale_secs: 600, sweep_secs: 300 });
        assert!(cfg.validate().is_err());
        cfg.sweep_enabled = false;
        cfg.validate().unwrap();
    }

    #[test]
    fn json_overlay_keeps_defaults() {
        let cfg: WatchConfig = serde_json::from_value(serde_json::json!({
            "clusterId": "c1",
            "taskgroupThreads": 4,
            "timings": { "Service": { "tickSecs": 5, "staleSecs": 60, "sweepSecs": 100 } }
        }))
        .unwrap();
        assert_eq!(cfg.taskgroup_threads, 4);
        assert_eq!(cfg.application_threads, 10);
        assert_eq!(cfg.timing(ResourceType::Service).tick_secs, 5);
        assert_eq!(cfg.timing(ResourceType::Secret), ResourceTiming::defaults_for(ResourceType::Secret));
        assert_eq!(cfg.planner().channels(ResourceType::TaskGroup).len(), 4);
    }
}
