//! Registration and discovery of datawatch candidates for one cluster.

use async_trait::async_trait;
use datawatch_kubehub::zk::join_path;
use datawatch_kubehub::{create_all, CreateMode, ZkClient, ZkError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// What a candidate publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub ip: String,
    pub port: u16,
    pub cluster: String,
    pub pid: u32,
    pub version: String,
    /// RFC 3339 wall-clock time of registration.
    pub registered_at: String,
}

impl ServerInfo {
    pub fn new(ip: &str, port: u16, cluster: &str) -> Self {
        Self {
            ip: ip.to_string(),
            port,
            cluster: cluster.to_string(),
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            registered_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn address(&self) -> String { format!("{}:{}", self.ip, self.port) }
}

/// One live registration; `id` is opaque and unique per registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: String,
    pub info: ServerInfo,
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("zookeeper: {0}")]
    Zk(#[from] ZkError),
    #[error("decoding registration {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("kubernetes: {0}")]
    Kube(#[from] kube::Error),
    #[error("registration {0} is gone")]
    Lost(String),
}

#[async_trait]
pub trait Discovery: Send + Sync {
    /// Publish `me`; returns the registration id.
    async fn register(&self, me: &ServerInfo) -> Result<String, DiscoveryError>;

    /// Every live registration, oldest first. The first entry is the master.
    async fn servers(&self) -> Result<Vec<Registration>, DiscoveryError>;
}

/// Ephemeral sequential nodes under `<basepath>/<module>/<cluster>`.
pub struct ZkDiscovery<Z> {
    zk: Z,
    dir: String,
}

impl<Z: ZkClient> ZkDiscovery<Z> {
    pub fn new(zk: Z, basepath: &str, module: &str, cluster: &str) -> Self {
        let dir = join_path(&join_path(basepath.trim_end_matches('/'), module), cluster);
        Self { zk, dir }
    }

    pub fn dir(&self) -> &str { &self.dir }
}

/// Sequence number ZooKeeper appended to a sequential node name.
fn sequence(name: &str) -> Option<u64> {
    let split = name.len().checked_sub(10)?;
    name.get(split..)?.parse().ok()
}

#[async_trait]
impl<Z: ZkClient> Discovery for ZkDiscovery<Z> {
    async fn register(&self, me: &ServerInfo) -> Result<String, DiscoveryError> {
        create_all(&self.zk, &self.dir).await?;
        let data = serde_json::to_vec(me).map_err(|source| DiscoveryError::Decode { path: self.dir.clone(), source })?;
        let prefix = join_path(&self.dir, &format!("{}-", me.address()));
        let path = self.zk.create(&prefix, &data, CreateMode::EphemeralSequential).await?;
        info!(path = %path, "registered");
        Ok(path)
    }

    async fn servers(&self) -> Result<Vec<Registration>, DiscoveryError> {
        let mut names = match self.zk.children(&self.dir).await {
            Ok(n) => n,
            Err(ZkError::NoNode(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        names.sort_by_key(|n| sequence(n).unwrap_or(u64::MAX));
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let path = join_path(&self.dir, &name);
            let data = match self.zk.get(&path).await {
                Ok(d) => d,
                Err(ZkError::NoNode(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_slice::<ServerInfo>(&data) {
                Ok(info) => out.push(Registration { id: path, info }),
                Err(e) => warn!(path = %path, error = %e, "ignoring malformed registration"),
            }
        }
        debug!(dir = %self.dir, count = out.len(), "discovered servers");
        Ok(out)
    }
}

/// Single-node discovery: whoever registers is the only server.
#[derive(Default)]
pub struct StandaloneDiscovery {
    me: Mutex<Option<ServerInfo>>,
}

impl StandaloneDiscovery {
    pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl Discovery for StandaloneDiscovery {
    async fn register(&self, me: &ServerInfo) -> Result<String, DiscoveryError> {
        *self.me.lock() = Some(me.clone());
        Ok("standalone".into())
    }

    async fn servers(&self) -> Result<Vec<Registration>, DiscoveryError> {
        Ok(self.me.lock().iter().map(|info| Registration { id: "standalone".into(), info: info.clone() }).collect())
    }
}
