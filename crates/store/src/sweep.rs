//! Dirty sweep: periodically remove remote entries nobody refreshed within the TTL.

use std::sync::Arc;
use std::time::Duration;

use datawatch_core::{ResourceType, WatchConfig};
use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::StorageClient;
use crate::tasks::TaskCounter;

/// Unix seconds before which remote entries count as dirty.
pub fn cutoff(now_unix: i64, ttl: Duration) -> i64 { now_unix - ttl.as_secs() as i64 }

pub async fn sweep_once(storage: &dyn StorageClient, cluster: &str, resource: ResourceType, ttl: Duration) -> bool {
    let cutoff = cutoff(chrono::Utc::now().timestamp(), ttl);
    let res = storage.delete_stale(resource, cutoff).await;
    let status = if res.is_ok() { "ok" } else { "failed" };
    counter!("datawatch_sweep_total", 1u64, "cluster" => cluster.to_string(), "resource" => resource.as_str(), "status" => status);
    match res {
        Ok(()) => {
            info!(resource = %resource, cutoff, "dirty sweep done");
            true
        }
        Err(e) => {
            warn!(resource = %resource, error = %e, "dirty sweep failed");
            false
        }
    }
}

/// One sweep task per resource type; the first sweep runs one period after start.
pub fn spawn_sweeps(
    cfg: &WatchConfig,
    storage: Arc<dyn StorageClient>,
    cancel: &CancellationToken,
    tasks: &TaskCounter,
) -> Vec<JoinHandle<()>> {
    ResourceType::ALL
        .iter()
        .map(|&rt| {
            let every = cfg.timing(rt).sweep_every();
            let ttl = cfg.sweep_ttl();
            let cluster = cfg.cluster_id.clone();
            let storage = storage.clone();
            let cancel = cancel.child_token();
            tasks.spawn(async move {
                let mut ticker = interval_at(Instant::now() + every, every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = sweep_once(&*storage, &cluster, rt, ttl) => {}
                            }
                        }
                    }
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_subtracts_ttl() {
        assert_eq!(cutoff(1_700_000_600, Duration::from_secs(600)), 1_700_000_000);
    }
}
