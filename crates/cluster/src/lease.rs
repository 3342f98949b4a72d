//! Discovery through Kubernetes `Lease` objects, one per registration.
//!
//! Each candidate creates a lease labelled with its cluster and renews it on every listing.
//! Leases not renewed within their duration are ignored and garbage-collected by whoever
//! lists next. Registrations are ordered by creation time, so the oldest live lease is master.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::discovery::{Discovery, DiscoveryError, Registration, ServerInfo};

const LABEL_APP: &str = "app.kubernetes.io/name";
const LABEL_CLUSTER: &str = "datawatch.io/cluster";
const INFO_ANNOTATION: &str = "datawatch.io/server-info";
const DEFAULT_TTL: Duration = Duration::from_secs(15);

pub struct LeaseDiscovery {
    api: Api<Lease>,
    cluster: String,
    ttl: Duration,
    mine: Mutex<Option<String>>,
}

impl LeaseDiscovery {
    pub fn new(client: Client, namespace: &str, cluster: &str) -> Self {
        Self { api: Api::namespaced(client, namespace), cluster: cluster.to_string(), ttl: DEFAULT_TTL, mine: Mutex::new(None) }
    }

    /// How long a lease stays live without renewal; keep it well above the election poll.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn selector(&self) -> String { format!("{}=datawatch,{}={}", LABEL_APP, LABEL_CLUSTER, label_value(&self.cluster)) }

    async fn renew(&self) -> Result<(), DiscoveryError> {
        let Some(name) = self.mine.lock().clone() else { return Ok(()) };
        let patch = serde_json::json!({ "spec": { "renewTime": MicroTime(Utc::now()) } });
        match self.api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch)).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(lease = %name, "own lease is gone");
                self.mine.lock().take();
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Label values allow at most 63 characters out of `[A-Za-z0-9._-]`.
fn label_value(s: &str) -> String {
    s.chars().map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '-' }).take(63).collect()
}

/// `generateName` prefix: lowercase DNS label characters only.
fn name_prefix(cluster: &str) -> String {
    let mut slug: String =
        cluster.to_ascii_lowercase().chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '-' }).take(40).collect();
    slug = slug.trim_matches('-').to_string();
    if slug.is_empty() { "datawatch-".to_string() } else { format!("datawatch-{}-", slug) }
}

/// Split `leases` into live registrations (oldest first) and the names of expired leases.
pub fn partition_leases(leases: &[Lease], now: DateTime<Utc>, default_ttl: Duration) -> (Vec<Registration>, Vec<String>) {
    let mut live = Vec::new();
    let mut expired = Vec::new();
    for lease in leases {
        let (Some(name), Some(created)) = (&lease.metadata.name, &lease.metadata.creation_timestamp) else { continue };
        let spec = lease.spec.clone().unwrap_or_default();
        let renewed = spec.renew_time.map(|t| t.0).unwrap_or(created.0);
        let ttl = spec.lease_duration_seconds.map(|s| Duration::from_secs(s.max(0) as u64)).unwrap_or(default_ttl);
        // A renewal stamped in the future (clock skew) counts as fresh.
        if now.signed_duration_since(renewed).to_std().is_ok_and(|age| age > ttl) {
            expired.push(name.clone());
            continue;
        }
        let info = lease.metadata.annotations.as_ref().and_then(|a| a.get(INFO_ANNOTATION));
        match info.map(|raw| serde_json::from_str::<ServerInfo>(raw)) {
            Some(Ok(info)) => live.push((created.0, name.clone(), info)),
            Some(Err(e)) => warn!(lease = %name, error = %e, "ignoring malformed registration"),
            None => warn!(lease = %name, "ignoring lease without server info"),
        }
    }
    live.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
    (live.into_iter().map(|(_, id, info)| Registration { id, info }).collect(), expired)
}

#[async_trait]
impl Discovery for LeaseDiscovery {
    async fn register(&self, me: &ServerInfo) -> Result<String, DiscoveryError> {
        let info = serde_json::to_string(me).map_err(|source| DiscoveryError::Decode { path: self.selector(), source })?;
        let now = MicroTime(Utc::now());
        let lease = Lease {
            metadata: ObjectMeta {
                generate_name: Some(name_prefix(&self.cluster)),
                labels: Some(BTreeMap::from([
                    (LABEL_APP.to_string(), "datawatch".to_string()),
                    (LABEL_CLUSTER.to_string(), label_value(&self.cluster)),
                ])),
                annotations: Some(BTreeMap::from([(INFO_ANNOTATION.to_string(), info)])),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(me.address()),
                lease_duration_seconds: Some(self.ttl.as_secs().min(i32::MAX as u64) as i32),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                ..Default::default()
            }),
        };
        let created = self.api.create(&PostParams::default(), &lease).await?;
        let name = created.metadata.name.ok_or_else(|| DiscoveryError::Lost("lease created without a name".into()))?;
        info!(lease = %name, "registered");
        *self.mine.lock() = Some(name.clone());
        Ok(name)
    }

    async fn servers(&self) -> Result<Vec<Registration>, DiscoveryError> {
        self.renew().await?;
        let leases = self.api.list(&ListParams::default().labels(&self.selector())).await?;
        let (live, expired) = partition_leases(&leases.items, Utc::now(), self.ttl);
        for name in expired {
            match self.api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => debug!(lease = %name, "removed expired lease"),
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => warn!(lease = %name, error = %e, "failed to remove expired lease"),
            }
        }
        debug!(cluster = %self.cluster, count = live.len(), "discovered servers");
        Ok(live)
    }
}
