//! ZooKeeper tree source: `<base>/<type>/<namespace>/<name>` nodes holding JSON.
//!
//! Listing walks the tree. Watching runs a supervisor that owns one cancellation token per
//! watched path: the root watch reports namespaces, namespace watches report node names and
//! node watches push data. Watch tasks never touch the table; they message the supervisor,
//! which spawns and cancels tasks and turns disappearing nodes into immediate removals.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use datawatch_core::{entity_key, SyncEntity};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::zk::{join_path, ZkClient, ZkError, ZkEventKind, ZkWatch};
use crate::{Change, Source, SourceError};

const ROOT_RETRY: Duration = Duration::from_secs(3);
const PUSH_CAPACITY: usize = 1024;

pub struct ZkTreeSource<T> {
    zk: Arc<dyn ZkClient>,
    root: String,
    retry: Duration,
    active: Arc<AtomicUsize>,
    _t: PhantomData<fn() -> T>,
}

impl<T: SyncEntity> ZkTreeSource<T> {
    /// Source rooted at `<base>/<storage path of T>`.
    pub fn new(zk: Arc<dyn ZkClient>, base: &str) -> Self {
        let root = join_path(base.trim_end_matches('/'), T::RESOURCE.storage_path());
        Self { zk, root, retry: ROOT_RETRY, active: Arc::new(AtomicUsize::new(0)), _t: PhantomData }
    }

    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    pub fn root(&self) -> &str { &self.root }

    /// Number of live watch tasks, supervisor included.
    pub fn active_watches(&self) -> usize { self.active.load(Ordering::SeqCst) }

    async fn children_or_empty(&self, path: &str) -> Result<Option<Vec<String>>, ZkError> {
        match self.zk.children(path).await {
            Ok(c) => Ok(Some(c)),
            Err(ZkError::NoNode(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<T: SyncEntity> Source<T> for ZkTreeSource<T> {
    fn describe(&self) -> String { format!("zookeeper:{}", self.root) }

    async fn list(&self) -> Result<Vec<T>, SourceError> {
        let Some(namespaces) = self.children_or_empty(&self.root).await? else {
            debug!(root = %self.root, "tree root absent");
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for ns in namespaces {
            let ns_path = join_path(&self.root, &ns);
            let Some(names) = self.children_or_empty(&ns_path).await? else { continue };
            for name in names {
                let path = join_path(&ns_path, &name);
                let data = match self.zk.get(&path).await {
                    Ok(d) => d,
                    Err(ZkError::NoNode(_)) => continue,
                    Err(e) => return Err(e.into()),
                };
                match serde_json::from_slice::<T>(&data) {
                    Ok(item) => out.push(item),
                    Err(e) => warn!(path = %path, error = %e, "skipping undecodable node"),
                }
            }
        }
        Ok(out)
    }

    fn watch(&self, cancel: CancellationToken) -> Option<mpsc::Receiver<Change<T>>> {
        let (out, rx) = mpsc::channel(PUSH_CAPACITY);
        let sup = Supervisor::<T> {
            zk: self.zk.clone(),
            root: self.root.clone(),
            retry: self.retry,
            active: self.active.clone(),
            out,
            table: FxHashMap::default(),
            next_id: Arc::new(AtomicU64::new(1)),
            _t: PhantomData,
        };
        let guard = ActiveGuard::new(&self.active);
        tokio::spawn(async move {
            let _guard = guard;
            sup.run(cancel).await;
        });
        Some(rx)
    }
}

/// Counts a live watch task for as long as it is held.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(n: &Arc<AtomicUsize>) -> Self {
        n.fetch_add(1, Ordering::SeqCst);
        Self(n.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) { self.0.fetch_sub(1, Ordering::SeqCst); }
}

enum Msg {
    /// Current children of `parent`.
    Children { parent: String, names: Vec<String> },
    /// The watch task `id` on `path` lost its node.
    Gone { path: String, id: u64 },
}

struct Slot {
    id: u64,
    token: CancellationToken,
}

struct Supervisor<T> {
    zk: Arc<dyn ZkClient>,
    root: String,
    retry: Duration,
    active: Arc<AtomicUsize>,
    out: mpsc::Sender<Change<T>>,
    table: FxHashMap<String, Slot>,
    next_id: Arc<AtomicU64>,
    _t: PhantomData<fn() -> T>,
}

impl<T: SyncEntity> Supervisor<T> {
    async fn run(mut self, cancel: CancellationToken) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Msg>();
        info!(root = %self.root, "tree watch started");
        let root_token = cancel.child_token();
        self.spawn_root(tx.clone(), root_token.clone());
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.out.closed() => None,
                m = rx.recv() => m,
            };
            let Some(msg) = msg else { break };
            let ok = match msg {
                Msg::Children { parent, names } => self.on_children(&tx, &cancel, &parent, names).await,
                Msg::Gone { path, id } => {
                    if self.table.get(&path).map(|s| s.id) != Some(id) {
                        true
                    } else if matches!(self.zk.exists(&path).await, Ok(true)) {
                        self.rewatch(&tx, &cancel, path).await
                    } else {
                        self.drop_subtree(&path).await
                    }
                }
            };
            if !ok {
                debug!(root = %self.root, "push receiver dropped");
                break;
            }
        }
        root_token.cancel();
        for slot in self.table.values() {
            slot.token.cancel();
        }
        info!(root = %self.root, "tree watch stopped");
    }

    fn depth(&self, path: &str) -> usize {
        path.strip_prefix(&self.root).map(|rest| rest.split('/').filter(|s| !s.is_empty()).count()).unwrap_or(0)
    }

    fn direct_children(&self, parent: &str) -> Vec<String> {
        let prefix = format!("{}/", parent);
        self.table.keys().filter(|p| p.strip_prefix(&prefix).is_some_and(|rest| !rest.contains('/'))).cloned().collect()
    }

    /// Reconcile the watched children of `parent` with `names`. Returns false once the push
    /// receiver is gone.
    async fn on_children(
        &mut self,
        tx: &mpsc::UnboundedSender<Msg>,
        cancel: &CancellationToken,
        parent: &str,
        names: Vec<String>,
    ) -> bool {
        // A late report for a namespace that is no longer watched.
        if parent != self.root && !self.table.contains_key(parent) {
            return true;
        }
        let wanted: Vec<String> = names.iter().map(|n| join_path(parent, n)).collect();
        for path in self.direct_children(parent) {
            if !wanted.contains(&path) && !self.drop_subtree(&path).await {
                return false;
            }
        }
        for path in wanted {
            if !self.table.contains_key(&path) {
                self.watch_path(tx, cancel, path);
            }
        }
        true
    }

    /// Spawn the namespace or node watch for `path` under its parent's token.
    fn watch_path(&mut self, tx: &mpsc::UnboundedSender<Msg>, cancel: &CancellationToken, path: String) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let parent = path.rsplit_once('/').map(|(p, _)| p).unwrap_or_default();
        let token = match self.table.get(parent) {
            Some(p) => p.token.child_token(),
            None => cancel.child_token(),
        };
        match self.depth(&path) {
            1 => self.spawn_namespace(tx.clone(), path.clone(), id, token.clone()),
            2 => self.spawn_node(tx.clone(), path.clone(), id, token.clone()),
            _ => return,
        }
        self.table.insert(path, Slot { id, token });
    }

    /// `path` was deleted and created again before its loss was handled. Watch it afresh and
    /// remove only the nested nodes that are really gone.
    async fn rewatch(&mut self, tx: &mpsc::UnboundedSender<Msg>, cancel: &CancellationToken, path: String) -> bool {
        let prefix = format!("{}/", path);
        let nested: Vec<String> = self.table.keys().filter(|p| p.starts_with(&prefix)).cloned().collect();
        for p in nested {
            if let Some(slot) = self.table.remove(&p) {
                slot.token.cancel();
            }
            if matches!(self.zk.exists(&p).await, Ok(true)) {
                continue;
            }
            if let Some(key) = self.key_of(&p) {
                if self.out.send(Change::Remove(key)).await.is_err() {
                    return false;
                }
            }
        }
        if let Some(slot) = self.table.remove(&path) {
            slot.token.cancel();
        }
        debug!(path = %path, "path recreated; watching again");
        self.watch_path(tx, cancel, path);
        true
    }

    /// Cancel `path` and everything under it, emitting a removal for each entity node.
    async fn drop_subtree(&mut self, path: &str) -> bool {
        let prefix = format!("{}/", path);
        let doomed: Vec<String> =
            self.table.keys().filter(|p| p.as_str() == path || p.starts_with(&prefix)).cloned().collect();
        for p in doomed {
            if let Some(slot) = self.table.remove(&p) {
                slot.token.cancel();
            }
            if self.depth(&p) == 2 {
                if let Some(key) = self.key_of(&p) {
                    debug!(path = %p, "node gone");
                    if self.out.send(Change::Remove(key)).await.is_err() {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn key_of(&self, node_path: &str) -> Option<String> {
        let rest = node_path.strip_prefix(&self.root)?.trim_start_matches('/');
        let (ns, name) = rest.split_once('/')?;
        Some(entity_key(ns, name))
    }

    fn spawn_root(&self, tx: mpsc::UnboundedSender<Msg>, token: CancellationToken) {
        let zk = self.zk.clone();
        let root = self.root.clone();
        let retry = self.retry;
        let guard = ActiveGuard::new(&self.active);
        tokio::spawn(async move {
            let _guard = guard;
            loop {
                match zk.children_w(&root).await {
                    Ok((names, w)) => {
                        if tx.send(Msg::Children { parent: root.clone(), names }).is_err() {
                            return;
                        }
                        if wait(&token, w).await.is_none() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(root = %root, error = %e, "root watch failed; retrying");
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep(retry) => {}
                        }
                    }
                }
            }
        });
    }

    fn spawn_namespace(&self, tx: mpsc::UnboundedSender<Msg>, path: String, id: u64, token: CancellationToken) {
        let zk = self.zk.clone();
        let retry = self.retry;
        let guard = ActiveGuard::new(&self.active);
        tokio::spawn(async move {
            let _guard = guard;
            loop {
                match zk.children_w(&path).await {
                    Ok((names, w)) => {
                        if tx.send(Msg::Children { parent: path.clone(), names }).is_err() {
                            return;
                        }
                        match wait(&token, w).await {
                            None => return,
                            Some(ZkEventKind::NodeDeleted | ZkEventKind::SessionExpired) => break,
                            Some(_) => {}
                        }
                    }
                    Err(ZkError::NoNode(_) | ZkError::SessionExpired) => break,
                    Err(e) => {
                        warn!(path = %path, error = %e, "namespace watch failed; retrying");
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep(retry) => {}
                        }
                    }
                }
            }
            let _ = tx.send(Msg::Gone { path, id });
        });
    }

    fn spawn_node(&self, tx: mpsc::UnboundedSender<Msg>, path: String, id: u64, token: CancellationToken) {
        let zk = self.zk.clone();
        let out = self.out.clone();
        let retry = self.retry;
        let guard = ActiveGuard::new(&self.active);
        tokio::spawn(async move {
            let _guard = guard;
            loop {
                match zk.get_w(&path).await {
                    Ok((data, w)) => {
                        match serde_json::from_slice::<T>(&data) {
                            Ok(item) => {
                                let sent = tokio::select! {
                                    _ = token.cancelled() => return,
                                    r = out.send(Change::Upsert(item)) => r,
                                };
                                if sent.is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!(path = %path, error = %e, "skipping undecodable node"),
                        }
                        match wait(&token, w).await {
                            None => return,
                            Some(ZkEventKind::NodeDeleted | ZkEventKind::SessionExpired) => break,
                            Some(_) => {}
                        }
                    }
                    Err(ZkError::NoNode(_) | ZkError::SessionExpired) => break,
                    Err(e) => {
                        warn!(path = %path, error = %e, "node watch failed; retrying");
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep(retry) => {}
                        }
                    }
                }
            }
            let _ = tx.send(Msg::Gone { path, id });
        });
    }
}

/// Wait for a one-shot watch. `None` when cancelled; a dropped watch counts as session loss.
async fn wait(token: &CancellationToken, w: ZkWatch) -> Option<ZkEventKind> {
    tokio::select! {
        _ = token.cancelled() => None,
        ev = w => Some(ev.map(|e| e.kind).unwrap_or(ZkEventKind::SessionExpired)),
    }
}
