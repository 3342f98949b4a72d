//! Typed entities and the closed `Entity` sum carried inside every `SyncEvent`.
//!
//! Only identity, labels/selectors and the few fields the export synthesizer reads are
//! modelled; everything else the orchestrator writes is kept verbatim in `extra`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

/// The nine resource kinds tracked per cluster.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    Application,
    TaskGroup,
    Service,
    Deployment,
    ConfigMap,
    Secret,
    Endpoint,
    ExportService,
    IpPool,
}

impl ResourceType {
    pub const ALL: [ResourceType; 9] = [
        ResourceType::Application,
        ResourceType::TaskGroup,
        ResourceType::Service,
        ResourceType::Deployment,
        ResourceType::ConfigMap,
        ResourceType::Secret,
        ResourceType::Endpoint,
        ResourceType::ExportService,
        ResourceType::IpPool,
    ];

    /// Name used for channels and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Application => "Application",
            ResourceType::TaskGroup => "TaskGroup",
            ResourceType::Service => "Service",
            ResourceType::Deployment => "Deployment",
            ResourceType::ConfigMap => "ConfigMap",
            ResourceType::Secret => "Secret",
            ResourceType::Endpoint => "Endpoint",
            ResourceType::ExportService => "ExportService",
            ResourceType::IpPool => "IPPool",
        }
    }

    /// Path segment in the storage API and in the ZooKeeper tree.
    pub fn storage_path(&self) -> &'static str {
        match self {
            ResourceType::Application => "application",
            ResourceType::TaskGroup => "taskgroup",
            ResourceType::Service => "service",
            ResourceType::Deployment => "deployment",
            ResourceType::ConfigMap => "configmap",
            ResourceType::Secret => "secret",
            ResourceType::Endpoint => "endpoint",
            ResourceType::ExportService => "exportservice",
            ResourceType::IpPool => "ippoolstatic",
        }
    }

    pub fn is_namespaced(&self) -> bool { !matches!(self, ResourceType::IpPool) }

    /// High-volume kinds are spread over N delivery channels keyed by entity.
    pub fn is_sharded(&self) -> bool {
        matches!(
            self,
            ResourceType::Application | ResourceType::TaskGroup | ResourceType::ExportService | ResourceType::Deployment
        )
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for ResourceType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::ALL
            .iter()
            .copied()
            .find(|rt| rt.as_str().eq_ignore_ascii_case(s) || rt.storage_path() == s.to_ascii_lowercase())
            .ok_or_else(|| CoreError::Config(format!("unknown resource type: {}", s)))
    }
}

/// Builds the cache/shard key for an entity: `namespace/name`, or `name` when cluster-scoped.
pub fn entity_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() { name.to_string() } else { format!("{}/{}", namespace, name) }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self { name: name.to_string(), namespace: namespace.to_string(), ..Default::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub instances: u32,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Network attachment of a task group; decides how backends are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Host,
    Bridge,
    Cnm,
    Cni,
}

impl NetworkMode {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "host" => NetworkMode::Host,
            "bridge" | "default" => NetworkMode::Bridge,
            "user" | "cnm" => NetworkMode::Cnm,
            _ => NetworkMode::Cni,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub name: String,
    #[serde(default)]
    pub container_port: i32,
    /// 0 when the port is not mapped on the node.
    #[serde(default)]
    pub host_port: i32,
    #[serde(default)]
    pub protocol: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
}

/// A task group (pod): the schedulable unit carrying backends for services.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskGroup {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: String,
    /// IP of the node the group runs on.
    #[serde(default, rename = "hostIP")]
    pub host_ip: String,
    /// IP assigned to the group's containers.
    #[serde(default, rename = "podIP")]
    pub pod_ip: String,
    #[serde(default)]
    pub network_mode: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskGroup {
    pub fn is_running(&self) -> bool { self.status.eq_ignore_ascii_case("running") }

    pub fn network(&self) -> NetworkMode { NetworkMode::parse(&self.network_mode) }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    pub name: String,
    #[serde(default)]
    pub protocol: String,
    pub service_port: i32,
    #[serde(default)]
    pub target_port: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    #[serde(default, rename = "clusterIP")]
    pub cluster_ip: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Service {
    /// Equality-based selector match; an empty selector selects nothing.
    pub fn selects(&self, labels: &BTreeMap<String, String>) -> bool {
        !self.selector.is_empty() && self.selector.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub metadata: ObjectMeta,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMap {
    pub metadata: ObjectMeta,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    pub metadata: ObjectMeta,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub metadata: ObjectMeta,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    #[serde(rename = "targetIP")]
    pub target_ip: String,
    pub target_port: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportPort {
    pub name: String,
    pub protocol: String,
    pub service_port: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    pub backends: Vec<Backend>,
}

/// Load-balancer view of a service: one entry per exported port with its backends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportService {
    pub cluster: String,
    pub namespace: String,
    pub service_name: String,
    pub balance: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub weights: BTreeMap<String, u32>,
    pub ports: Vec<ExportPort>,
}

impl ExportService {
    pub fn port_mut(&mut self, name: &str) -> Option<&mut ExportPort> { self.ports.iter_mut().find(|p| p.name == name) }
}

/// Static IP pool of one network segment as reported by the netservice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpPool {
    pub net: String,
    #[serde(default)]
    pub mask: i32,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub reserved: Vec<String>,
    #[serde(default)]
    pub available: Vec<String>,
    #[serde(default)]
    pub active: Vec<String>,
}

/// Entity types that flow through reconciliation and delivery.
pub trait SyncEntity: Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    const RESOURCE: ResourceType;

    fn namespace(&self) -> &str;
    fn name(&self) -> &str;
    fn into_entity(self) -> Entity;

    fn key(&self) -> String { entity_key(self.namespace(), self.name()) }
}

macro_rules! meta_entity {
    ($ty:ident) => {
        impl SyncEntity for $ty {
            const RESOURCE: ResourceType = ResourceType::$ty;

            fn namespace(&self) -> &str { &self.metadata.namespace }
            fn name(&self) -> &str { &self.metadata.name }
            fn into_entity(self) -> Entity { Entity::$ty(self) }
        }
    };
}

meta_entity!(Application);
meta_entity!(TaskGroup);
meta_entity!(Service);
meta_entity!(Deployment);
meta_entity!(ConfigMap);
meta_entity!(Secret);
meta_entity!(Endpoint);

impl SyncEntity for ExportService {
    const RESOURCE: ResourceType = ResourceType::ExportService;

    fn namespace(&self) -> &str { &self.namespace }
    fn name(&self) -> &str { &self.service_name }
    fn into_entity(self) -> Entity { Entity::ExportService(self) }
}

impl SyncEntity for IpPool {
    const RESOURCE: ResourceType = ResourceType::IpPool;

    fn namespace(&self) -> &str { "" }
    fn name(&self) -> &str { &self.net }
    fn into_entity(self) -> Entity { Entity::IpPool(self) }
}

/// Closed sum over every entity kind; serializes as the inner entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Entity {
    Application(Application),
    TaskGroup(TaskGroup),
    Service(Service),
    Deployment(Deployment),
    ConfigMap(ConfigMap),
    Secret(Secret),
    Endpoint(Endpoint),
    ExportService(ExportService),
    IpPool(IpPool),
}

impl Entity {
    pub fn resource(&self) -> ResourceType {
        match self {
            Entity::Application(_) => ResourceType::Application,
            Entity::TaskGroup(_) => ResourceType::TaskGroup,
            Entity::Service(_) => ResourceType::Service,
            Entity::Deployment(_) => ResourceType::Deployment,
            Entity::ConfigMap(_) => ResourceType::ConfigMap,
            Entity::Secret(_) => ResourceType::Secret,
            Entity::Endpoint(_) => ResourceType::Endpoint,
            Entity::ExportService(_) => ResourceType::ExportService,
            Entity::IpPool(_) => ResourceType::IpPool,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Entity::Application(e) => e.namespace(),
            Entity::TaskGroup(e) => e.namespace(),
            Entity::Service(e) => e.namespace(),
            Entity::Deployment(e) => e.namespace(),
            Entity::ConfigMap(e) => e.namespace(),
            Entity::Secret(e) => e.namespace(),
            Entity::Endpoint(e) => e.namespace(),
            Entity::ExportService(e) => e.namespace(),
            Entity::IpPool(e) => e.namespace(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Entity::Application(e) => e.name(),
            Entity::TaskGroup(e) => e.name(),
            Entity::Service(e) => e.name(),
            Entity::Deployment(e) => e.name(),
            Entity::ConfigMap(e) => e.name(),
            Entity::Secret(e) => e.name(),
            Entity::Endpoint(e) => e.name(),
            Entity::ExportService(e) => e.name(),
            Entity::IpPool(e) => e.name(),
        }
    }

    pub fn key(&self) -> String { entity_key(self.namespace(), self.name()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_type_parses_both_spellings() {
        assert_eq!("taskgroup".parse::<ResourceType>().unwrap(), ResourceType::TaskGroup);
        assert_eq!("IPPool".parse::<ResourceType>().unwrap(), ResourceType::IpPool);
        assert_eq!("ippoolstatic".parse::<ResourceType>().unwrap(), ResourceType::IpPool);
        assert!("pods".parse::<ResourceType>().is_err());
    }

    #[test]
    fn taskgroup_decodes_and_keeps_unknown_fields() {
        let raw = serde_json::json!({
            "metadata": { "name": "tg-1", "namespace": "ns", "labels": { "app": "x" } },
            "status": "RUNNING",
            "hostIP": "10.0.0.1",
            "podIP": "172.16.0.2",
            "networkMode": "BRIDGE",
            "tasks": [ { "name": "web", "ports": [ { "name": "http", "containerPort": 80, "hostPort": 8080 } ] } ],
            "launchTime": 12345
        });
        let tg: TaskGroup = serde_json::from_value(raw).unwrap();
        assert!(tg.is_running());
        assert_eq!(tg.network(), NetworkMode::Bridge);
        assert_eq!(tg.tasks[0].ports[0].host_port, 8080);
        assert_eq!(tg.extra.get("launchTime"), Some(&serde_json::json!(12345)));
        assert_eq!(tg.key(), "ns/tg-1");
    }

    #[test]
    fn entity_serializes_as_inner_object() {
        let cm = ConfigMap { metadata: ObjectMeta::new("ns", "cfg"), extra: Map::new() };
        let v = serde_json::to_value(cm.into_entity()).unwrap();
        assert_eq!(v["metadata"]["name"], "cfg");
    }

    #[test]
    fn selector_requires_every_pair() {
        let mut svc = Service { metadata: ObjectMeta::new("ns", "svc"), ..Default::default() };
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "x".to_string());
        assert!(!svc.selects(&labels), "empty selector selects nothing");
        svc.selector.insert("app".into(), "x".into());
        assert!(svc.selects(&labels));
        svc.selector.insert("tier".into(), "web".into());
        assert!(!svc.selects(&labels));
    }

    #[test]
    fn ip_pool_is_cluster_scoped() {
        let pool = IpPool { net: "10.1.0.0".into(), ..Default::default() };
        assert_eq!(pool.key(), "10.1.0.0");
        assert!(!ResourceType::IpPool.is_namespaced());
    }
}
