//! ExportService synthesis: load-balancer views derived from Services and their TaskGroups.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use datawatch_core::{
    Backend, CacheRecord, Entity, ExportPort, ExportService, NetworkMode, Service, SyncAction, SyncEntity, SyncEvent,
    TaskGroup,
};
use datawatch_store::EventSink;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const LABEL_BALANCE: &str = "BCSBALANCE";
pub const LABEL_GROUP: &str = "BCSGROUP";
pub const LABEL_WEIGHT_PREFIX: &str = "BCS-WEIGHT-";
pub const DEFAULT_BALANCE: &str = "roundrobin";

/// Export skeleton of `svc`: metadata from labels, one port per service port, no backends.
pub fn skeleton(cluster: &str, svc: &Service) -> ExportService {
    let labels = &svc.metadata.labels;
    let balance = labels.get(LABEL_BALANCE).filter(|b| !b.is_empty()).cloned().unwrap_or_else(|| DEFAULT_BALANCE.into());
    let groups = labels
        .get(LABEL_GROUP)
        .map(|g| g.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect())
        .unwrap_or_default();
    let weights: BTreeMap<String, u32> = labels
        .iter()
        .filter_map(|(k, v)| Some((k.strip_prefix(LABEL_WEIGHT_PREFIX)?.to_string(), v.trim().parse().ok()?)))
        .collect();
    ExportService {
        cluster: cluster.to_string(),
        namespace: svc.metadata.namespace.clone(),
        service_name: svc.metadata.name.clone(),
        balance,
        groups,
        weights,
        ports: svc
            .ports
            .iter()
            .map(|p| ExportPort {
                name: p.name.clone(),
                protocol: p.protocol.clone(),
                service_port: p.service_port,
                domain: p.domain_name.clone(),
                path: p.path.clone(),
                backends: Vec::new(),
            })
            .collect(),
    }
}

/// Backends `tg` contributes to the port named `port`. Only running groups contribute.
pub fn resolve(tg: &TaskGroup, port: &str) -> Vec<Backend> {
    if !tg.is_running() {
        return Vec::new();
    }
    let mode = tg.network();
    tg.tasks
        .iter()
        .flat_map(|t| t.ports.iter())
        .filter(|p| p.name == port)
        .map(|p| match mode {
            NetworkMode::Host => Backend { target_ip: tg.host_ip.clone(), target_port: p.container_port },
            NetworkMode::Bridge | NetworkMode::Cnm if p.host_port > 0 => {
                Backend { target_ip: tg.host_ip.clone(), target_port: p.host_port }
            }
            _ => Backend { target_ip: tg.pod_ip.clone(), target_port: p.container_port },
        })
        .filter(|b| !b.target_ip.is_empty())
        .collect()
}

fn normalize(backends: &mut Vec<Backend>) {
    backends.sort();
    backends.dedup();
}

pub struct ExportServiceSynthesizer {
    cluster: String,
    stale_after: Duration,
    services: FxHashMap<String, Service>,
    taskgroups: FxHashMap<String, TaskGroup>,
    exports: FxHashMap<String, CacheRecord<ExportService>>,
}

impl ExportServiceSynthesizer {
    pub fn new(cluster: &str, stale_after: Duration) -> Self {
        Self {
            cluster: cluster.to_string(),
            stale_after,
            services: FxHashMap::default(),
            taskgroups: FxHashMap::default(),
            exports: FxHashMap::default(),
        }
    }

    pub fn export(&self, key: &str) -> Option<&ExportService> { self.exports.get(key).map(|r| &r.data) }

    pub fn len(&self) -> usize { self.exports.len() }

    pub fn is_empty(&self) -> bool { self.exports.is_empty() }

    /// Fold one Service or TaskGroup event in; returns the ExportService events it causes.
    pub fn on_event(&mut self, ev: &SyncEvent, now: Instant) -> Vec<SyncEvent> {
        match &ev.item {
            Entity::Service(svc) => self.on_service(ev.action, svc, now),
            Entity::TaskGroup(tg) => self.on_taskgroup(ev.action, tg, now),
            _ => Vec::new(),
        }
    }

    fn on_service(&mut self, action: SyncAction, svc: &Service, now: Instant) -> Vec<SyncEvent> {
        let key = svc.key();
        if action == SyncAction::Delete {
            self.services.remove(&key);
            return match self.exports.remove(&key) {
                Some(rec) => vec![SyncEvent::of(SyncAction::Delete, rec.data)],
                None => Vec::new(),
            };
        }
        let mut export = skeleton(&self.cluster, svc);
        for tg in self.taskgroups.values().filter(|tg| tg.metadata.namespace == svc.metadata.namespace) {
            if !svc.selects(&tg.metadata.labels) {
                continue;
            }
            for port in export.ports.iter_mut() {
                port.backends.extend(resolve(tg, &port.name));
            }
        }
        for port in export.ports.iter_mut() {
            normalize(&mut port.backends);
        }
        self.services.insert(key.clone(), svc.clone());
        match self.exports.get_mut(&key) {
            None => {
                self.exports.insert(key, CacheRecord::new(export.clone(), now, 0));
                vec![SyncEvent::of(SyncAction::Add, export)]
            }
            Some(rec) if rec.data != export => {
                rec.data = export.clone();
                rec.report_time = now;
                vec![SyncEvent::of(SyncAction::Update, export)]
            }
            Some(_) => Vec::new(),
        }
    }

    fn on_taskgroup(&mut self, action: SyncAction, tg: &TaskGroup, now: Instant) -> Vec<SyncEvent> {
        let key = tg.key();
        let old = if action == SyncAction::Delete {
            self.taskgroups.remove(&key)
        } else {
            self.taskgroups.insert(key.clone(), tg.clone())
        };
        let new = (action != SyncAction::Delete).then_some(tg);
        let ns = &tg.metadata.namespace;

        let mut events = Vec::new();
        for (svc_key, svc) in self.services.iter().filter(|(_, s)| &s.metadata.namespace == ns) {
            let before = old.as_ref().filter(|o| svc.selects(&o.metadata.labels));
            let after = new.filter(|n| svc.selects(&n.metadata.labels));
            if before.is_none() && after.is_none() {
                continue;
            }
            let Some(rec) = self.exports.get_mut(svc_key) else { continue };
            let mut export = rec.data.clone();
            for port in export.ports.iter_mut() {
                if let Some(b) = before {
                    let gone = resolve(b, &port.name);
                    if !gone.is_empty() {
                        // pairs another selected group still resolves to stay
                        let kept: Vec<Backend> = self
                            .taskgroups
                            .iter()
                            .filter(|(k, t)| **k != key && &t.metadata.namespace == ns && svc.selects(&t.metadata.labels))
                            .flat_map(|(_, t)| resolve(t, &port.name))
                            .collect();
                        port.backends.retain(|x| !gone.contains(x) || kept.contains(x));
                    }
                }
                if let Some(a) = after {
                    port.backends.extend(resolve(a, &port.name));
                }
                normalize(&mut port.backends);
            }
            if export != rec.data {
                debug!(export = %svc_key, taskgroup = %tg.key(), "backends changed");
                rec.data = export.clone();
                rec.report_time = now;
                events.push(SyncEvent::of(SyncAction::Update, export));
            }
        }
        events
    }

    /// Re-assert exports nothing reported for longer than the staleness threshold.
    pub fn heartbeat(&mut self, now: Instant) -> Vec<SyncEvent> {
        let stale_after = self.stale_after;
        self.exports
            .values_mut()
            .filter(|r| r.is_stale(now, stale_after))
            .map(|r| {
                r.report_time = now;
                SyncEvent::of(SyncAction::Update, r.data.clone())
            })
            .collect()
    }

    /// Consume tapped events until `cancel` fires or the tap closes.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<SyncEvent>,
        sink: Arc<dyn EventSink>,
        tick: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(cluster = %self.cluster, "export synthesizer started");
        loop {
            let events = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.heartbeat(Instant::now()),
                ev = rx.recv() => match ev {
                    Some(ev) => self.on_event(&ev, Instant::now()),
                    None => break,
                },
            };
            for ev in events {
                sink.submit(ev).await;
            }
        }
        self.exports.clear();
        info!(cluster = %self.cluster, "export synthesizer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datawatch_core::{ObjectMeta, PortMapping, ServicePort, Task};

    fn svc(labels: &[(&str, &str)]) -> Service {
        let mut meta = ObjectMeta::new("ns", "web");
        meta.labels = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let mut s = Service { metadata: meta, ..Default::default() };
        s.selector.insert("app".into(), "x".into());
        s.ports.push(ServicePort { name: "http".into(), protocol: "http".into(), service_port: 80, ..Default::default() });
        s
    }

    fn tg(name: &str, mode: &str, host_port: i32, status: &str) -> TaskGroup {
        let mut meta = ObjectMeta::new("ns", name);
        meta.labels.insert("app".into(), "x".into());
        TaskGroup {
            metadata: meta,
            status: status.into(),
            host_ip: "10.0.0.1".into(),
            pod_ip: "172.16.0.5".into(),
            network_mode: mode.into(),
            tasks: vec![Task {
                name: "c".into(),
                status: "running".into(),
                ports: vec![PortMapping { name: "http".into(), container_port: 80, host_port, protocol: "tcp".into() }],
            }],
            ..Default::default()
        }
    }

    #[test]
    fn labels_drive_export_metadata() {
        let e = skeleton("c1", &svc(&[("BCSGROUP", "g1, g2,"), ("BCS-WEIGHT-app1", "30"), ("BCS-WEIGHT-bad", "x")]));
        assert_eq!(e.balance, "roundrobin");
        assert_eq!(e.groups, vec!["g1".to_string(), "g2".to_string()]);
        assert_eq!(e.weights.get("app1"), Some(&30));
        assert!(!e.weights.contains_key("bad"));
        assert_eq!(skeleton("c1", &svc(&[("BCSBALANCE", "source")])).balance, "source");
    }

    #[test]
    fn resolution_follows_network_mode() {
        let b = |mode, hp| resolve(&tg("t", mode, hp, "Running"), "http");
        assert_eq!(b("host", 8080), vec![Backend { target_ip: "10.0.0.1".into(), target_port: 80 }]);
        assert_eq!(b("bridge", 8080), vec![Backend { target_ip: "10.0.0.1".into(), target_port: 8080 }]);
        assert_eq!(b("bridge", 0), vec![Backend { target_ip: "172.16.0.5".into(), target_port: 80 }]);
        assert_eq!(b("cni", 8080), vec![Backend { target_ip: "172.16.0.5".into(), target_port: 80 }]);
        assert!(resolve(&tg("t", "bridge", 8080, "Staging"), "http").is_empty());
        assert!(resolve(&tg("t", "bridge", 8080, "Running"), "grpc").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn taskgroup_lifecycle_updates_backends() {
        let mut s = ExportServiceSynthesizer::new("c1", Duration::from_secs(360));
        let now = Instant::now();
        let add = s.on_event(&SyncEvent::of(SyncAction::Add, svc(&[])), now);
        assert_eq!(add.len(), 1);
        assert_eq!(add[0].action, SyncAction::Add);

        let evs = s.on_event(&SyncEvent::of(SyncAction::Add, tg("t1", "bridge", 8080, "Running")), now);
        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].action, SyncAction::Update);
        let port = &s.export("ns/web").unwrap().ports[0];
        assert_eq!(port.backends, vec![Backend { target_ip: "10.0.0.1".into(), target_port: 8080 }]);

        // same state again: nothing to say
        assert!(s.on_event(&SyncEvent::of(SyncAction::Update, tg("t1", "bridge", 8080, "Running")), now).is_empty());

        let evs = s.on_event(&SyncEvent::of(SyncAction::Delete, tg("t1", "bridge", 8080, "Running")), now);
        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].action, SyncAction::Update);
        assert!(s.export("ns/web").unwrap().ports[0].backends.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_pairs_collapse_and_service_delete_removes_export() {
        let mut s = ExportServiceSynthesizer::new("c1", Duration::from_secs(360));
        let now = Instant::now();
        s.on_event(&SyncEvent::of(SyncAction::Add, tg("t1", "host", 0, "Running")), now);
        s.on_event(&SyncEvent::of(SyncAction::Add, tg("t2", "host", 0, "Running")), now);
        s.on_event(&SyncEvent::of(SyncAction::Add, svc(&[])), now);
        assert_eq!(s.export("ns/web").unwrap().ports[0].backends.len(), 1);

        // t2 still resolves to the shared pair
        assert!(s.on_event(&SyncEvent::of(SyncAction::Delete, tg("t1", "host", 0, "Running")), now).is_empty());
        assert_eq!(s.export("ns/web").unwrap().ports[0].backends.len(), 1);

        let evs = s.on_event(&SyncEvent::of(SyncAction::Delete, svc(&[])), now);
        assert_eq!(evs[0].action, SyncAction::Delete);
        assert!(s.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_exports_are_reasserted() {
        let mut s = ExportServiceSynthesizer::new("c1", Duration::from_secs(360));
        s.on_event(&SyncEvent::of(SyncAction::Add, svc(&[])), Instant::now());
        assert!(s.heartbeat(Instant::now()).is_empty());
        tokio::time::advance(Duration::from_secs(361)).await;
        assert_eq!(s.heartbeat(Instant::now()).len(), 1);
        assert!(s.heartbeat(Instant::now()).is_empty());
    }
}
