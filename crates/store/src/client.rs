//! Storage API client: the `StorageClient` seam and its reqwest implementation.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use datawatch_core::{ResourceType, SyncEvent};
use metrics::histogram;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Connection-level failure; the request may be retried on another server.
    #[error("transport: {0}")]
    Transport(String),
    #[error("storage answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("storage rejected the request: {0}")]
    Rejected(String),
    #[error("storage client config: {0}")]
    Config(String),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool { matches!(self, StorageError::Transport(_)) }
}

#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Create or overwrite the event's entity.
    async fn put(&self, event: &SyncEvent) -> Result<(), StorageError>;

    /// Remove the event's entity; a missing entity is not an error.
    async fn delete(&self, event: &SyncEvent) -> Result<(), StorageError>;

    /// Remove every entry of `resource` last updated before `cutoff_unix` (seconds).
    async fn delete_stale(&self, resource: ResourceType, cutoff_unix: i64) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageConfig {
    /// `scheme://host:port` of each storage server, tried in rotation.
    pub servers: Vec<String>,
    /// Path prefix in front of `/dynamic/...`.
    pub prefix: String,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            prefix: "bcsstorage/v1".into(),
            ca_file: None,
            cert_file: None,
            key_file: None,
            timeout_secs: 10,
        }
    }
}

fn base(server: &str, prefix: &str) -> String {
    let server = server.trim_end_matches('/');
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() { server.to_string() } else { format!("{}/{}", server, prefix) }
}

/// URL of one entity. IPPool lives under `cluster_resources`, everything else is namespaced.
pub fn entity_url(server: &str, prefix: &str, cluster: &str, resource: ResourceType, namespace: &str, name: &str) -> String {
    let b = base(server, prefix);
    if resource.is_namespaced() {
        format!(
            "{}/dynamic/namespace_resources/clusters/{}/namespaces/{}/{}/{}",
            b,
            cluster,
            namespace,
            resource.storage_path(),
            name
        )
    } else {
        format!("{}/dynamic/cluster_resources/clusters/{}/{}/{}", b, cluster, resource.storage_path(), name)
    }
}

pub fn sweep_url(server: &str, prefix: &str, cluster: &str, resource: ResourceType) -> String {
    format!("{}/dynamic/all_resources/clusters/{}/{}", base(server, prefix), cluster, resource.storage_path())
}

/// `{"result": false, "message": ...}` bodies are rejections even with a 2xx status.
fn check_result(body: &str) -> Result<(), StorageError> {
    let Ok(v) = serde_json::from_str::<Value>(body) else { return Ok(()) };
    if v.get("result") == Some(&Value::Bool(false)) {
        let msg = v.get("message").and_then(Value::as_str).unwrap_or(body);
        return Err(StorageError::Rejected(msg.to_string()));
    }
    Ok(())
}

fn read_pem(path: &Path) -> Result<Vec<u8>, StorageError> {
    std::fs::read(path).map_err(|e| StorageError::Config(format!("reading {}: {}", path.display(), e)))
}

pub struct HttpStorage {
    http: reqwest::Client,
    servers: Vec<String>,
    prefix: String,
    cluster: String,
    cursor: AtomicUsize,
}

impl HttpStorage {
    pub fn new(cfg: &StorageConfig, cluster: &str) -> Result<Self, StorageError> {
        if cfg.servers.is_empty() {
            return Err(StorageError::Config("no storage servers configured".into()));
        }
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(cfg.timeout_secs.max(1)));
        if let Some(ca) = &cfg.ca_file {
            let cert = reqwest::Certificate::from_pem(&read_pem(ca)?).map_err(|e| StorageError::Config(e.to_string()))?;
            builder = builder.add_root_certificate(cert);
        }
        match (&cfg.cert_file, &cfg.key_file) {
            (Some(cert), Some(key)) => {
                let mut pem = read_pem(cert)?;
                pem.push(b'\n');
                pem.extend(read_pem(key)?);
                let id = reqwest::Identity::from_pem(&pem).map_err(|e| StorageError::Config(e.to_string()))?;
                builder = builder.identity(id);
            }
            (None, None) => {}
            _ => return Err(StorageError::Config("client cert and key must be given together".into())),
        }
        let http = builder.build().map_err(|e| StorageError::Config(e.to_string()))?;
        Ok(Self {
            http,
            servers: cfg.servers.clone(),
            prefix: cfg.prefix.clone(),
            cluster: cluster.to_string(),
            cursor: AtomicUsize::new(0),
        })
    }

    fn server(&self) -> &str { &self.servers[self.cursor.load(Ordering::Relaxed) % self.servers.len()] }

    /// Move on to the next server after a transport failure.
    fn rotate(&self) { self.cursor.fetch_add(1, Ordering::Relaxed); }

    async fn send(
        &self,
        method: Method,
        url: String,
        body: Option<Value>,
        resource: ResourceType,
        missing_ok: bool,
    ) -> Result<(), StorageError> {
        let started = Instant::now();
        let mut req = self.http.request(method.clone(), &url);
        if let Some(b) = &body {
            req = req.json(b);
        }
        let res = req.send().await;
        histogram!(
            "datawatch_storage_request_ms",
            started.elapsed().as_secs_f64() * 1000.0,
            "cluster" => self.cluster.clone(),
            "resource" => resource.as_str(),
            "method" => method.to_string()
        );
        let resp = match res {
            Ok(r) => r,
            Err(e) => {
                warn!(url = %url, error = %e, "storage request failed");
                self.rotate();
                return Err(StorageError::Transport(e.to_string()));
            }
        };
        let status = resp.status();
        if missing_ok && status == StatusCode::NOT_FOUND {
            debug!(url = %url, "already absent");
            return Ok(());
        }
        let text = match resp.text().await {
            Ok(t) => t,
            Err(e) => {
                self.rotate();
                return Err(StorageError::Transport(e.to_string()));
            }
        };
        if !status.is_success() {
            return Err(StorageError::Status { status: status.as_u16(), body: text.chars().take(256).collect() });
        }
        check_result(&text)
    }

    fn url_for(&self, event: &SyncEvent) -> String {
        entity_url(self.server(), &self.prefix, &self.cluster, event.resource, event.item.namespace(), event.item.name())
    }
}

#[async_trait]
impl StorageClient for HttpStorage {
    async fn put(&self, event: &SyncEvent) -> Result<(), StorageError> {
        let body = json!({ "data": event.item });
        self.send(Method::PUT, self.url_for(event), Some(body), event.resource, false).await
    }

    async fn delete(&self, event: &SyncEvent) -> Result<(), StorageError> {
        self.send(Method::DELETE, self.url_for(event), None, event.resource, true).await
    }

    async fn delete_stale(&self, resource: ResourceType, cutoff_unix: i64) -> Result<(), StorageError> {
        let url = sweep_url(self.server(), &self.prefix, &self.cluster, resource);
        let body = json!({ "updateTimeBegin": 0, "updateTimeEnd": cutoff_unix });
        self.send(Method::DELETE, url, Some(body), resource, true).await
    }
}
