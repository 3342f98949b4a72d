//! Conversions from kube objects into datawatch entities.

use datawatch_core::{ConfigMap, Deployment, Endpoint, ObjectMeta, PortMapping, Secret, Service, ServicePort, Task, TaskGroup};
use k8s_openapi::api::apps::v1::Deployment as KubeDeployment;
use k8s_openapi::api::core::v1::{
    ConfigMap as KubeConfigMap, ContainerStatus, Endpoints, Pod, Secret as KubeSecret, Service as KubeService,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta as KubeMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::Serialize;
use serde_json::{Map, Value};

fn meta(m: &KubeMeta) -> ObjectMeta {
    ObjectMeta {
        name: m.name.clone().unwrap_or_default(),
        namespace: m.namespace.clone().unwrap_or_default(),
        labels: m.labels.clone().unwrap_or_default(),
        annotations: m.annotations.clone().unwrap_or_default(),
    }
}

/// Everything except the metadata, with managed fields gone.
fn opaque<K: Serialize>(obj: &K) -> Map<String, Value> {
    match serde_json::to_value(obj) {
        Ok(Value::Object(mut m)) => {
            m.remove("metadata");
            m
        }
        _ => Map::new(),
    }
}

fn container_state(st: Option<&ContainerStatus>) -> String {
    let Some(state) = st.and_then(|s| s.state.as_ref()) else { return String::new() };
    if state.running.is_some() {
        "running".into()
    } else if state.terminated.is_some() {
        "terminated".into()
    } else if state.waiting.is_some() {
        "waiting".into()
    } else {
        String::new()
    }
}

/// Pod → TaskGroup. Host-network pods resolve to the node address, all others to the pod IP.
pub fn pod_to_taskgroup(pod: &Pod) -> Option<TaskGroup> {
    let spec = pod.spec.as_ref()?;
    let status = pod.status.clone().unwrap_or_default();
    let statuses = status.container_statuses.clone().unwrap_or_default();
    let tasks = spec
        .containers
        .iter()
        .map(|c| Task {
            name: c.name.clone(),
            status: container_state(statuses.iter().find(|s| s.name == c.name)),
            ports: c
                .ports
                .iter()
                .flatten()
                .map(|p| PortMapping {
                    name: p.name.clone().unwrap_or_default(),
                    container_port: p.container_port,
                    host_port: p.host_port.unwrap_or(0),
                    protocol: p.protocol.clone().unwrap_or_else(|| "TCP".into()),
                })
                .collect(),
        })
        .collect();
    let mut extra = Map::new();
    if let Some(node) = &spec.node_name {
        extra.insert("nodeName".into(), Value::String(node.clone()));
    }
    if let Some(uid) = &pod.metadata.uid {
        extra.insert("uid".into(), Value::String(uid.clone()));
    }
    Some(TaskGroup {
        metadata: meta(&pod.metadata),
        status: status.phase.unwrap_or_default(),
        host_ip: status.host_ip.unwrap_or_default(),
        pod_ip: status.pod_ip.unwrap_or_default(),
        network_mode: if spec.host_network == Some(true) { "host".into() } else { "cni".into() },
        tasks,
        extra,
    })
}

pub fn service(svc: &KubeService) -> Option<Service> {
    let spec = svc.spec.as_ref()?;
    let ports = spec
        .ports
        .iter()
        .flatten()
        .map(|p| ServicePort {
            name: p.name.clone().unwrap_or_default(),
            protocol: p.protocol.clone().unwrap_or_else(|| "TCP".into()),
            service_port: p.port,
            target_port: match &p.target_port {
                Some(IntOrString::Int(i)) => *i,
                Some(IntOrString::String(_)) | None => p.port,
            },
            ..Default::default()
        })
        .collect();
    let cluster_ip = match (&spec.cluster_ips, &spec.cluster_ip) {
        (Some(ips), _) if !ips.is_empty() => ips.clone(),
        (_, Some(ip)) => vec![ip.clone()],
        _ => Vec::new(),
    };
    let mut extra = Map::new();
    if let Some(t) = &spec.type_ {
        extra.insert("type".into(), Value::String(t.clone()));
    }
    Some(Service {
        metadata: meta(&svc.metadata),
        selector: spec.selector.clone().unwrap_or_default(),
        ports,
        cluster_ip,
        extra,
    })
}

pub fn deployment(d: &KubeDeployment) -> Option<Deployment> {
    Some(Deployment { metadata: meta(&d.metadata), extra: opaque(d) })
}

pub fn configmap(c: &KubeConfigMap) -> Option<ConfigMap> {
    Some(ConfigMap { metadata: meta(&c.metadata), extra: opaque(c) })
}

pub fn secret(s: &KubeSecret) -> Option<Secret> { Some(Secret { metadata: meta(&s.metadata), extra: opaque(s) }) }

pub fn endpoints(e: &Endpoints) -> Option<Endpoint> {
    Some(Endpoint { metadata: meta(&e.metadata), extra: opaque(e) })
}
