use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use datawatch_cluster::{ClusterCoordinator, Discovery, EngineFactory, EngineHandle, LeaseDiscovery, ServerInfo, StandaloneDiscovery};
use datawatch_core::{ResourceType, WatchConfig};
use datawatch_kubehub::{convert, InformerSource, NetserviceSource, Source};
use datawatch_store::{HttpStorage, StorageConfig};
use datawatch_sync::{EngineSources, WatchEngine};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Pod, Secret, Service};
use kube::{Api, Client};
use serde::Deserialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "datawatchd", version, about = "Mirror cluster state into the storage service")]
struct Cli {
    /// JSON file with `watch` and `storage` sections; flags override it
    #[arg(long = "config", env = "DATAWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long = "cluster-id", env = "DATAWATCH_CLUSTER_ID")]
    cluster_id: Option<String>,

    /// Storage servers, e.g. https://10.0.0.1:8443 (comma separated)
    #[arg(long = "storage", env = "DATAWATCH_STORAGE", value_delimiter = ',')]
    storage: Vec<String>,

    #[arg(long = "ca-file", env = "DATAWATCH_CA_FILE")]
    ca_file: Option<PathBuf>,

    #[arg(long = "cert-file", env = "DATAWATCH_CERT_FILE")]
    cert_file: Option<PathBuf>,

    #[arg(long = "key-file", env = "DATAWATCH_KEY_FILE")]
    key_file: Option<PathBuf>,

    /// Netservice servers for IP pools; IP pools are not watched when empty
    #[arg(long = "netservice", env = "DATAWATCH_NETSERVICE", value_delimiter = ',')]
    netservice: Vec<String>,

    #[arg(long = "application-threads")]
    application_threads: Option<usize>,

    #[arg(long = "taskgroup-threads")]
    taskgroup_threads: Option<usize>,

    #[arg(long = "exportservice-threads")]
    exportservice_threads: Option<usize>,

    #[arg(long = "deployment-threads")]
    deployment_threads: Option<usize>,

    /// Resource types not to watch (comma separated)
    #[arg(long = "disable", value_delimiter = ',')]
    disable: Vec<ResourceType>,

    /// Address published for this instance
    #[arg(long = "ip", env = "DATAWATCH_IP", default_value = "127.0.0.1")]
    ip: String,

    #[arg(long = "port", env = "DATAWATCH_PORT", default_value_t = 9080)]
    port: u16,

    /// Namespace holding election leases; without it this instance is always master
    #[arg(long = "lease-namespace", env = "DATAWATCH_LEASE_NAMESPACE")]
    lease_namespace: Option<String>,

    /// Prometheus listener, host:port
    #[arg(long = "metrics-addr", env = "DATAWATCH_METRICS_ADDR")]
    metrics_addr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    watch: WatchConfig,
    storage: StorageConfig,
}

impl Cli {
    fn resolve(&self) -> Result<(WatchConfig, StorageConfig)> {
        let file = match &self.config {
            Some(path) => {
                let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_slice::<FileConfig>(&raw).with_context(|| format!("parsing {}", path.display()))?
            }
            None => FileConfig::default(),
        };
        let (mut watch, mut storage) = (file.watch, file.storage);
        if let Some(id) = &self.cluster_id {
            watch.cluster_id = id.clone();
        }
        for (flag, slot) in [
            (self.application_threads, &mut watch.application_threads),
            (self.taskgroup_threads, &mut watch.taskgroup_threads),
            (self.exportservice_threads, &mut watch.exportservice_threads),
            (self.deployment_threads, &mut watch.deployment_threads),
        ] {
            if let Some(n) = flag {
                *slot = n;
            }
        }
        if !self.storage.is_empty() {
            storage.servers = self.storage.clone();
        }
        storage.ca_file = self.ca_file.clone().or(storage.ca_file);
        storage.cert_file = self.cert_file.clone().or(storage.cert_file);
        storage.key_file = self.key_file.clone().or(storage.key_file);
        watch.validate()?;
        Ok((watch, storage))
    }
}

fn discovery(namespace: Option<&str>, client: &Client, cluster: &str) -> Arc<dyn Discovery> {
    match namespace {
        Some(ns) => {
            info!(namespace = %ns, "electing through leases");
            Arc::new(LeaseDiscovery::new(client.clone(), ns, cluster))
        }
        None => {
            info!("no lease namespace; running standalone");
            Arc::new(StandaloneDiscovery::new())
        }
    }
}

fn init_tracing() {
    let env = std::env::var("DATAWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        match builder.with_http_listener(sock).install() {
            Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        }
    } else {
        warn!(addr = %addr, "invalid metrics address; expected host:port");
    }
}

/// Informer-backed engines; each master term gets its own informers bound to the term token.
struct KubeFactory {
    client: Client,
    watch: WatchConfig,
    storage: StorageConfig,
    netservice: Vec<String>,
    disabled: Vec<ResourceType>,
}

impl KubeFactory {
    fn enabled(&self, rt: ResourceType) -> bool { !self.disabled.contains(&rt) }

    fn sources(&self, cancel: &CancellationToken) -> Result<EngineSources> {
        let c = &self.client;
        let mut s = EngineSources::default();
        if self.enabled(ResourceType::TaskGroup) {
            let src = InformerSource::start("pods", Api::<Pod>::all(c.clone()), convert::pod_to_taskgroup, cancel.clone());
            s.taskgroups = Some(Arc::new(src));
        }
        if self.enabled(ResourceType::Service) {
            let src = InformerSource::start("services", Api::<Service>::all(c.clone()), convert::service, cancel.clone());
            s.services = Some(Arc::new(src));
        }
        if self.enabled(ResourceType::Deployment) {
            let src = InformerSource::start("deployments", Api::<Deployment>::all(c.clone()), convert::deployment, cancel.clone());
            s.deployments = Some(Arc::new(src));
        }
        if self.enabled(ResourceType::ConfigMap) {
            let src = InformerSource::start("configmaps", Api::<ConfigMap>::all(c.clone()), convert::configmap, cancel.clone());
            s.configmaps = Some(Arc::new(src));
        }
        if self.enabled(ResourceType::Secret) {
            let src = InformerSource::start("secrets", Api::<Secret>::all(c.clone()), convert::secret, cancel.clone());
            s.secrets = Some(Arc::new(src));
        }
        if self.enabled(ResourceType::Endpoint) {
            let src = InformerSource::start("endpoints", Api::<Endpoints>::all(c.clone()), convert::endpoints, cancel.clone());
            s.endpoints = Some(Arc::new(src));
        }
        if self.enabled(ResourceType::IpPool) && !self.netservice.is_empty() {
            let src = NetserviceSource::new(self.netservice.clone(), &self.watch.cluster_id)?;
            info!(source = %src.describe(), "watching ip pools");
            s.ip_pools = Some(Arc::new(src));
        }
        Ok(s)
    }
}

#[async_trait]
impl EngineFactory for KubeFactory {
    async fn start(&self, cancel: CancellationToken) -> Result<Box<dyn EngineHandle>> {
        let storage = Arc::new(HttpStorage::new(&self.storage, &self.watch.cluster_id)?);
        let sources = match self.sources(&cancel) {
            Ok(s) => s,
            Err(e) => {
                cancel.cancel();
                return Err(e);
            }
        };
        let engine = WatchEngine::start(&self.watch, sources, storage, cancel).await?;
        Ok(Box::new(engine))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    init_metrics(cli.metrics_addr.as_deref());

    let (watch, storage) = cli.resolve()?;
    let client = Client::try_default().await.context("connecting to the kubernetes api")?;
    let me = ServerInfo::new(&cli.ip, cli.port, &watch.cluster_id);
    info!(cluster = %watch.cluster_id, storage = ?storage.servers, address = %me.address(), "datawatchd starting");

    let discovery = discovery(cli.lease_namespace.as_deref(), &client, &watch.cluster_id);
    let factory = Arc::new(KubeFactory { client, watch, storage, netservice: cli.netservice.clone(), disabled: cli.disable.clone() });
    let coordinator = ClusterCoordinator::new(me, discovery, factory);
    let cancel = CancellationToken::new();
    let run = coordinator.run(cancel.clone());
    tokio::pin!(run);

    let result = tokio::select! {
        r = &mut run => r,
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received; shutting down");
            cancel.cancel();
            run.await
        }
    };
    if let Err(e) = &result {
        error!(error = %e, "datawatchd stopped");
    }
    result
}
