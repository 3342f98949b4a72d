#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use datawatch_cluster::{
    ClusterCoordinator, Discovery, EngineFactory, EngineHandle, Role, ServerInfo, StandaloneDiscovery, ZkDiscovery,
};
use datawatch_core::{ObjectMeta, ResourceType, Service, WatchConfig};
use datawatch_kubehub::{CreateMode, MemSource, MemZk, ZkClient, ZkError, ZkWatch};
use datawatch_store::{MemoryStorage, TaskCounter};
use datawatch_sync::{EngineSources, WatchEngine};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const BASE: &str = "/bcs/services/endpoints";

#[derive(Default)]
struct Counting {
    live: Arc<AtomicUsize>,
    started: AtomicUsize,
    fail: bool,
}

struct Live(Arc<AtomicUsize>);

#[async_trait]
impl EngineHandle for Live {
    async fn shutdown(self: Box<Self>) { self.0.fetch_sub(1, Ordering::SeqCst); }
}

#[async_trait]
impl EngineFactory for Counting {
    async fn start(&self, _cancel: CancellationToken) -> anyhow::Result<Box<dyn EngineHandle>> {
        if self.fail {
            anyhow::bail!("initial list failed");
        }
        self.started.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Live(self.live.clone())))
    }
}

/// Fails `children` while `fail` is above zero, one call at a time.
struct Flaky {
    inner: MemZk,
    fail: Arc<AtomicUsize>,
}

#[async_trait]
impl ZkClient for Flaky {
    async fn get(&self, path: &str) -> Result<Vec<u8>, ZkError> { self.inner.get(path).await }
    async fn get_w(&self, path: &str) -> Result<(Vec<u8>, ZkWatch), ZkError> { self.inner.get_w(path).await }
    async fn children(&self, path: &str) -> Result<Vec<String>, ZkError> {
        if self.fail.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
            return Err(ZkError::ConnectionLoss(path.to_string()));
        }
        self.inner.children(path).await
    }
    async fn children_w(&self, path: &str) -> Result<(Vec<String>, ZkWatch), ZkError> { self.inner.children_w(path).await }
    async fn exists(&self, path: &str) -> Result<bool, ZkError> { self.inner.exists(path).await }
    async fn exists_w(&self, path: &str) -> Result<(bool, ZkWatch), ZkError> { self.inner.exists_w(path).await }
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String, ZkError> {
        self.inner.create(path, data, mode).await
    }
    async fn set(&self, path: &str, data: &[u8]) -> Result<(), ZkError> { self.inner.set(path, data).await }
    async fn delete(&self, path: &str) -> Result<(), ZkError> { self.inner.delete(path).await }
}

fn elect(discovery: Arc<dyn Discovery>, ip: &str, factory: Arc<dyn EngineFactory>) -> Arc<ClusterCoordinator> {
    Arc::new(ClusterCoordinator::new(ServerInfo::new(ip, 9000, "c1"), discovery, factory))
}

fn coordinator(zk: MemZk, ip: &str, factory: Arc<Counting>) -> Arc<ClusterCoordinator> {
    elect(Arc::new(ZkDiscovery::new(zk, BASE, "datawatch", "c1")), ip, factory)
}

/// Real watch graphs over an in-memory service source; keeps each term's task counter.
#[derive(Default)]
struct Engines {
    terms: Mutex<Vec<TaskCounter>>,
    expected: AtomicUsize,
}

#[async_trait]
impl EngineFactory for Engines {
    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<Box<dyn EngineHandle>> {
        let svc = Service { metadata: ObjectMeta::new("ns", "web"), ..Default::default() };
        let sources = EngineSources { services: Some(Arc::new(MemSource::with_items([svc]))), ..Default::default() };
        let engine = WatchEngine::start(&WatchConfig::new("c1"), sources, Arc::new(MemoryStorage::new()), cancel).await?;
        // one watcher, one consumer per channel, one sweep per resource type
        let expected = 1 + engine.pipeline().channels().len() + ResourceType::ALL.len();
        self.expected.store(expected, Ordering::SeqCst);
        self.terms.lock().unwrap().push(engine.task_counter());
        Ok(Box::new(engine))
    }
}

fn spawn(c: &Arc<ClusterCoordinator>, cancel: &CancellationToken) -> tokio::task::JoinHandle<anyhow::Result<()>> {
    let c = c.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move { c.run(cancel).await })
}

#[tokio::test(start_paused = true)]
async fn leadership_moves_when_master_session_expires() {
    let zk = MemZk::new();
    let za = zk.session();
    let factory = Arc::new(Counting::default());
    let a = coordinator(za.clone(), "10.0.0.1", factory.clone());
    let b = coordinator(zk.session(), "10.0.0.2", factory.clone());
    let cancel = CancellationToken::new();

    let ha = spawn(&a, &cancel);
    sleep(Duration::from_secs(1)).await;
    let hb = spawn(&b, &cancel);
    sleep(Duration::from_secs(1)).await;

    assert_eq!(a.role(), Role::Master);
    assert_eq!(b.role(), Role::Slave);
    assert_eq!(factory.live.load(Ordering::SeqCst), 1);
    let servers = b.servers();
    assert_eq!(servers.len(), 2);
    assert_eq!(servers[0].ip, "10.0.0.1");

    za.expire();
    sleep(Duration::from_secs(12)).await;

    assert_eq!(b.role(), Role::Master);
    assert_eq!(a.role(), Role::Init);
    assert_eq!(factory.live.load(Ordering::SeqCst), 1);
    assert_eq!(factory.started.load(Ordering::SeqCst), 2);

    cancel.cancel();
    ha.await.unwrap().unwrap();
    hb.await.unwrap().unwrap();
    assert_eq!(factory.live.load(Ordering::SeqCst), 0);
    assert_eq!(b.role(), Role::Init);
}

#[tokio::test(start_paused = true)]
async fn lost_registration_rejoins_behind_the_others() {
    let zk = MemZk::new();
    let factory = Arc::new(Counting::default());
    let a = coordinator(zk.session(), "10.0.0.1", factory.clone());
    let b = coordinator(zk.session(), "10.0.0.2", factory.clone());
    let cancel = CancellationToken::new();

    let ha = spawn(&a, &cancel);
    sleep(Duration::from_secs(1)).await;
    let hb = spawn(&b, &cancel);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(a.role(), Role::Master);

    let first = a.registration().unwrap();
    zk.delete(&first).await.unwrap();
    sleep(Duration::from_secs(12)).await;

    assert_eq!(b.role(), Role::Master);
    assert_eq!(a.role(), Role::Slave);
    assert_ne!(a.registration().unwrap(), first);
    assert_eq!(factory.live.load(Ordering::SeqCst), 1);
    assert_eq!(b.servers()[1].ip, "10.0.0.1");

    cancel.cancel();
    ha.await.unwrap().unwrap();
    hb.await.unwrap().unwrap();
    assert_eq!(factory.live.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_discovery_error_keeps_the_registration() {
    let zk = MemZk::new();
    let fail = Arc::new(AtomicUsize::new(0));
    let factory = Arc::new(Counting::default());
    let flaky = Flaky { inner: zk.session(), fail: fail.clone() };
    let a = elect(Arc::new(ZkDiscovery::new(flaky, BASE, "datawatch", "c1")), "10.0.0.1", factory.clone());
    let b = coordinator(zk.session(), "10.0.0.2", factory.clone());
    let cancel = CancellationToken::new();

    let ha = spawn(&a, &cancel);
    sleep(Duration::from_secs(1)).await;
    let hb = spawn(&b, &cancel);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(a.role(), Role::Master);
    let first = a.registration().unwrap();

    fail.store(1, Ordering::SeqCst);
    sleep(Duration::from_secs(60)).await;

    assert_eq!(fail.load(Ordering::SeqCst), 0);
    assert_eq!(a.registration().unwrap(), first);
    assert_eq!(a.role(), Role::Master);
    assert_eq!(b.role(), Role::Slave);
    assert_eq!(factory.live.load(Ordering::SeqCst), 1);
    assert_eq!(factory.started.load(Ordering::SeqCst), 2);
    assert_eq!(zk.children(&format!("{}/datawatch/c1", BASE)).await.unwrap().len(), 2);

    cancel.cancel();
    ha.await.unwrap().unwrap();
    hb.await.unwrap().unwrap();
    assert_eq!(factory.live.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn only_the_next_in_line_takes_over() {
    let zk = MemZk::new();
    let za = zk.session();
    let factory = Arc::new(Counting::default());
    let a = coordinator(za.clone(), "10.0.0.1", factory.clone());
    let b = coordinator(zk.session(), "10.0.0.2", factory.clone());
    let c = coordinator(zk.session(), "10.0.0.3", factory.clone());
    let cancel = CancellationToken::new();

    let ha = spawn(&a, &cancel);
    sleep(Duration::from_secs(1)).await;
    let hb = spawn(&b, &cancel);
    sleep(Duration::from_secs(1)).await;
    let hc = spawn(&c, &cancel);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(a.role(), Role::Master);
    assert_eq!(c.servers().len(), 3);

    za.expire();
    sleep(Duration::from_secs(12)).await;

    assert_eq!(b.role(), Role::Master);
    assert_eq!(c.role(), Role::Slave);
    assert_eq!(factory.live.load(Ordering::SeqCst), 1);
    assert_eq!(factory.started.load(Ordering::SeqCst), 2);
    let ips: Vec<String> = c.servers().into_iter().map(|s| s.ip).collect();
    assert_eq!(ips, vec!["10.0.0.2".to_string(), "10.0.0.3".to_string()]);

    cancel.cancel();
    for h in [ha, hb, hc] {
        h.await.unwrap().unwrap();
    }
    assert_eq!(factory.live.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn demoted_master_stops_its_whole_watch_graph() {
    let zk = MemZk::new();
    let za = zk.session();
    let engines = Arc::new(Engines::default());
    let a = elect(Arc::new(ZkDiscovery::new(za.clone(), BASE, "datawatch", "c1")), "10.0.0.1", engines.clone());
    let b = elect(Arc::new(ZkDiscovery::new(zk.session(), BASE, "datawatch", "c1")), "10.0.0.2", engines.clone());
    let cancel = CancellationToken::new();

    let ha = spawn(&a, &cancel);
    sleep(Duration::from_secs(1)).await;
    let hb = spawn(&b, &cancel);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(a.role(), Role::Master);
    let expected = engines.expected.load(Ordering::SeqCst);
    assert_eq!(engines.terms.lock().unwrap()[0].live(), expected);

    za.expire();
    sleep(Duration::from_secs(12)).await;

    assert_eq!(b.role(), Role::Master);
    {
        let terms = engines.terms.lock().unwrap();
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[0].live(), 0);
        assert_eq!(terms[1].live(), expected);
    }

    cancel.cancel();
    ha.await.unwrap().unwrap();
    hb.await.unwrap().unwrap();
    assert!(engines.terms.lock().unwrap().iter().all(|t| t.live() == 0));
}

#[tokio::test(start_paused = true)]
async fn standalone_is_always_master() {
    let factory = Arc::new(Counting::default());
    let c = Arc::new(ClusterCoordinator::new(
        ServerInfo::new("127.0.0.1", 9000, "c1"),
        Arc::new(StandaloneDiscovery::new()),
        factory.clone(),
    ));
    let cancel = CancellationToken::new();
    let h = spawn(&c, &cancel);
    sleep(Duration::from_secs(30)).await;
    assert_eq!(c.role(), Role::Master);
    assert_eq!(c.servers().len(), 1);
    assert_eq!(factory.started.load(Ordering::SeqCst), 1);
    cancel.cancel();
    h.await.unwrap().unwrap();
    assert_eq!(factory.live.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn engine_start_failure_ends_the_run() {
    let factory = Arc::new(Counting { fail: true, ..Default::default() });
    let c = ClusterCoordinator::new(
        ServerInfo::new("127.0.0.1", 9000, "c1"),
        Arc::new(StandaloneDiscovery::new()),
        factory.clone(),
    );
    let err = c.run(CancellationToken::new()).await.unwrap_err();
    assert!(err.to_string().contains("initial list failed"));
    assert_eq!(c.role(), Role::Init);
    assert_eq!(factory.live.load(Ordering::SeqCst), 0);
}
