#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use datawatch_core::{ObjectMeta, PortMapping, ResourceType, Service, ServicePort, Task, TaskGroup, WatchConfig};
use datawatch_kubehub::{Change, MemSource};
use datawatch_store::MemoryStorage;
use datawatch_sync::{EngineSources, SyncError, WatchEngine};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn service() -> Service {
    let mut s = Service { metadata: ObjectMeta::new("ns", "web"), ..Default::default() };
    s.selector.insert("app".into(), "x".into());
    s.ports.push(ServicePort { name: "http".into(), protocol: "http".into(), service_port: 80, ..Default::default() });
    s
}

fn taskgroup() -> TaskGroup {
    let mut meta = ObjectMeta::new("ns", "t1");
    meta.labels.insert("app".into(), "x".into());
    TaskGroup {
        metadata: meta,
        status: "Running".into(),
        host_ip: "10.0.0.1".into(),
        pod_ip: "172.16.0.5".into(),
        network_mode: "bridge".into(),
        tasks: vec![Task {
            name: "web".into(),
            status: "running".into(),
            ports: vec![PortMapping { name: "http".into(), container_port: 80, host_port: 8080, protocol: "tcp".into() }],
        }],
        ..Default::default()
    }
}

fn config() -> WatchConfig {
    let mut cfg = WatchConfig::new("c1");
    cfg.sweep_enabled = false;
    cfg.taskgroup_threads = 2;
    cfg.exportservice_threads = 2;
    cfg
}

async fn eventually(mut f: impl FnMut() -> bool) {
    for _ in 0..500 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(flavor = "multi_thread")]
async fn backends_follow_taskgroup_lifecycle() {
    let services = Arc::new(MemSource::with_items([service()]));
    let taskgroups = Arc::new(MemSource::with_items([taskgroup()]));
    let sources = EngineSources { services: Some(services), taskgroups: Some(taskgroups.clone()), ..Default::default() };
    let storage = Arc::new(MemoryStorage::new());
    let engine = WatchEngine::start(&config(), sources, storage.clone(), CancellationToken::new()).await.unwrap();
    // synthesizer plus two watchers
    assert_eq!(engine.running_tasks(), 3);

    eventually(|| storage.get(ResourceType::ExportService, "ns/web").is_some()).await;
    let export = storage.get(ResourceType::ExportService, "ns/web").unwrap();
    assert_eq!(export["ports"][0]["backends"], json!([{ "targetIP": "10.0.0.1", "targetPort": 8080 }]));
    assert_eq!(export["balance"], "roundrobin");
    assert!(storage.get(ResourceType::TaskGroup, "ns/t1").is_some());

    taskgroups.remove("ns/t1");
    let mut pushed = false;
    for _ in 0..100 {
        if taskgroups.push(Change::Remove("ns/t1".into())).await {
            pushed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(pushed);

    eventually(|| storage.get(ResourceType::TaskGroup, "ns/t1").is_none()).await;
    eventually(|| {
        storage
            .get(ResourceType::ExportService, "ns/web")
            .is_some_and(|e| e["ports"][0]["backends"] == json!([]))
    })
    .await;

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_initial_list_aborts_start() {
    let services = Arc::new(MemSource::with_items([service()]));
    let taskgroups = Arc::new(MemSource::<TaskGroup>::new());
    taskgroups.set_failing(true);
    let sources = EngineSources { services: Some(services), taskgroups: Some(taskgroups), ..Default::default() };
    let storage = Arc::new(MemoryStorage::new());
    let err = WatchEngine::start(&config(), sources, storage, CancellationToken::new()).await.err().unwrap();
    assert!(matches!(err, SyncError::Bootstrap { resource: ResourceType::TaskGroup, .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_config_is_rejected_before_start() {
    let mut cfg = config();
    cfg.cluster_id.clear();
    let storage = Arc::new(MemoryStorage::new());
    let err = WatchEngine::start(&cfg, EngineSources::default(), storage, CancellationToken::new()).await.err().unwrap();
    assert!(matches!(err, SyncError::Config(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_the_term_token_stops_everything() {
    let services = Arc::new(MemSource::with_items([service()]));
    let sources = EngineSources { services: Some(services), ..Default::default() };
    let storage = Arc::new(MemoryStorage::new());
    let cancel = CancellationToken::new();
    let engine = WatchEngine::start(&config(), sources, storage.clone(), cancel.clone()).await.unwrap();
    // no taskgroup source: no synthesizer
    assert_eq!(engine.running_tasks(), 1);
    let live = engine.task_counter();
    assert_eq!(live.live(), 1 + engine.pipeline().channels().len());
    cancel.cancel();
    eventually(|| engine.running_tasks() == 0).await;
    engine.shutdown().await;
    assert_eq!(live.live(), 0);
    assert!(storage.get(ResourceType::ExportService, "ns/web").is_none());
}
