//! Narrow ZooKeeper client surface plus an in-memory tree implementing it.
//!
//! Watches are one-shot, as in ZooKeeper: each `*_w` call registers a watch that fires at most
//! once. A dropped sender (closed session) surfaces as a receive error on the `ZkWatch`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ZkError {
    #[error("no node: {0}")]
    NoNode(String),
    #[error("node exists: {0}")]
    NodeExists(String),
    #[error("node has children: {0}")]
    NotEmpty(String),
    #[error("session expired")]
    SessionExpired,
    #[error("connection loss: {0}")]
    ConnectionLoss(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZkEventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
    SessionExpired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZkEvent {
    pub kind: ZkEventKind,
    pub path: String,
}

pub type ZkWatch = oneshot::Receiver<ZkEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    EphemeralSequential,
}

#[async_trait]
pub trait ZkClient: Send + Sync {
    async fn get(&self, path: &str) -> Result<Vec<u8>, ZkError>;
    async fn get_w(&self, path: &str) -> Result<(Vec<u8>, ZkWatch), ZkError>;
    async fn children(&self, path: &str) -> Result<Vec<String>, ZkError>;
    async fn children_w(&self, path: &str) -> Result<(Vec<String>, ZkWatch), ZkError>;
    async fn exists(&self, path: &str) -> Result<bool, ZkError>;
    async fn exists_w(&self, path: &str) -> Result<(bool, ZkWatch), ZkError>;
    /// Returns the created path (with the sequence suffix for sequential modes).
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String, ZkError>;
    async fn set(&self, path: &str, data: &[u8]) -> Result<(), ZkError>;
    async fn delete(&self, path: &str) -> Result<(), ZkError>;
}

/// Create `path` and any missing parents as persistent nodes; existing nodes are left alone.
pub async fn create_all(zk: &dyn ZkClient, path: &str) -> Result<(), ZkError> {
    let mut cur = String::new();
    for seg in path.split('/').filter(|s| !s.is_empty()) {
        cur.push('/');
        cur.push_str(seg);
        match zk.create(&cur, &[], CreateMode::Persistent).await {
            Ok(_) | Err(ZkError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub fn join_path(parent: &str, child: &str) -> String {
    if parent.ends_with('/') { format!("{}{}", parent, child) } else { format!("{}/{}", parent, child) }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn basename(path: &str) -> &str { path.rsplit('/').next().unwrap_or(path) }

struct Node {
    data: Vec<u8>,
    children: BTreeSet<String>,
    owner: Option<u64>,
}

type Watchers = HashMap<String, Vec<(u64, oneshot::Sender<ZkEvent>)>>;

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    data_watches: Watchers,
    child_watches: Watchers,
    exist_watches: Watchers,
    seq: HashMap<String, u64>,
    next_session: u64,
    expired: HashSet<u64>,
}

impl Tree {
    fn fire(watches: &mut Watchers, path: &str, kind: ZkEventKind) {
        if let Some(list) = watches.remove(path) {
            for (_, tx) in list {
                let _ = tx.send(ZkEvent { kind, path: path.to_string() });
            }
        }
    }

    fn register(watches: &mut Watchers, path: &str, session: u64) -> ZkWatch {
        let (tx, rx) = oneshot::channel();
        watches.entry(path.to_string()).or_default().push((session, tx));
        rx
    }

    fn check(&self, session: u64) -> Result<(), ZkError> {
        if self.expired.contains(&session) { Err(ZkError::SessionExpired) } else { Ok(()) }
    }

    fn remove_node(&mut self, path: &str) {
        self.nodes.remove(path);
        let parent = parent_of(path).to_string();
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.remove(basename(path));
        }
        Tree::fire(&mut self.data_watches, path, ZkEventKind::NodeDeleted);
        Tree::fire(&mut self.exist_watches, path, ZkEventKind::NodeDeleted);
        Tree::fire(&mut self.child_watches, path, ZkEventKind::NodeDeleted);
        Tree::fire(&mut self.child_watches, &parent, ZkEventKind::NodeChildrenChanged);
    }
}

/// In-memory ZooKeeper tree. Clones share one session; `session()` opens another on the same tree.
#[derive(Clone)]
pub struct MemZk {
    tree: Arc<Mutex<Tree>>,
    session: u64,
}

impl Default for MemZk {
    fn default() -> Self { Self::new() }
}

impl MemZk {
    pub fn new() -> Self {
        let mut tree = Tree { next_session: 1, ..Default::default() };
        tree.nodes.insert("/".to_string(), Node { data: Vec::new(), children: BTreeSet::new(), owner: None });
        Self { tree: Arc::new(Mutex::new(tree)), session: 0 }
    }

    /// Open a new session against the same tree.
    pub fn session(&self) -> MemZk {
        let mut t = self.tree.lock();
        let id = t.next_session;
        t.next_session += 1;
        MemZk { tree: self.tree.clone(), session: id }
    }

    /// Expire this session: its watches fire `SessionExpired`, its ephemeral nodes disappear
    /// and every later call through it fails.
    pub fn expire(&self) {
        let mut guard = self.tree.lock();
        let t = &mut *guard;
        t.expired.insert(self.session);
        let session = self.session;
        for watches in [&mut t.data_watches, &mut t.child_watches, &mut t.exist_watches] {
            for (path, list) in watches.iter_mut() {
                let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(list).into_iter().partition(|(s, _)| *s == session);
                *list = rest;
                for (_, tx) in mine {
                    let _ = tx.send(ZkEvent { kind: ZkEventKind::SessionExpired, path: path.clone() });
                }
            }
        }
        let owned: Vec<String> = t.nodes.iter().filter(|(_, n)| n.owner == Some(session)).map(|(p, _)| p.clone()).collect();
        for p in owned {
            t.remove_node(&p);
        }
    }

    /// Number of registered, not yet fired watches across all sessions.
    pub fn pending_watches(&self) -> usize {
        let t = self.tree.lock();
        [&t.data_watches, &t.child_watches, &t.exist_watches]
            .iter()
            .flat_map(|w| w.values())
            .map(|l| l.iter().filter(|(_, tx)| !tx.is_closed()).count())
            .sum()
    }
}

#[async_trait]
impl ZkClient for MemZk {
    async fn get(&self, path: &str) -> Result<Vec<u8>, ZkError> {
        let t = self.tree.lock();
        t.check(self.session)?;
        t.nodes.get(path).map(|n| n.data.clone()).ok_or_else(|| ZkError::NoNode(path.to_string()))
    }

    async fn get_w(&self, path: &str) -> Result<(Vec<u8>, ZkWatch), ZkError> {
        let mut t = self.tree.lock();
        t.check(self.session)?;
        let data = t.nodes.get(path).map(|n| n.data.clone()).ok_or_else(|| ZkError::NoNode(path.to_string()))?;
        let w = Tree::register(&mut t.data_watches, path, self.session);
        Ok((data, w))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, ZkError> {
        let t = self.tree.lock();
        t.check(self.session)?;
        t.nodes.get(path).map(|n| n.children.iter().cloned().collect()).ok_or_else(|| ZkError::NoNode(path.to_string()))
    }

    async fn children_w(&self, path: &str) -> Result<(Vec<String>, ZkWatch), ZkError> {
        let mut t = self.tree.lock();
        t.check(self.session)?;
        let children: Vec<String> =
            t.nodes.get(path).map(|n| n.children.iter().cloned().collect()).ok_or_else(|| ZkError::NoNode(path.to_string()))?;
        let w = Tree::register(&mut t.child_watches, path, self.session);
        Ok((children, w))
    }

    async fn exists(&self, path: &str) -> Result<bool, ZkError> {
        let t = self.tree.lock();
        t.check(self.session)?;
        Ok(t.nodes.contains_key(path))
    }

    async fn exists_w(&self, path: &str) -> Result<(bool, ZkWatch), ZkError> {
        let mut t = self.tree.lock();
        t.check(self.session)?;
        let exists = t.nodes.contains_key(path);
        let w = Tree::register(&mut t.exist_watches, path, self.session);
        Ok((exists, w))
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String, ZkError> {
        let mut t = self.tree.lock();
        t.check(self.session)?;
        let parent = parent_of(path).to_string();
        if !t.nodes.contains_key(&parent) {
            return Err(ZkError::NoNode(parent));
        }
        let full = match mode {
            CreateMode::EphemeralSequential => {
                let n = t.seq.entry(parent.clone()).or_insert(0);
                let full = format!("{}{:010}", path, *n);
                *n += 1;
                full
            }
            _ => path.to_string(),
        };
        if t.nodes.contains_key(&full) {
            return Err(ZkError::NodeExists(full));
        }
        let owner = if mode == CreateMode::Persistent { None } else { Some(self.session) };
        t.nodes.insert(full.clone(), Node { data: data.to_vec(), children: BTreeSet::new(), owner });
        if let Some(p) = t.nodes.get_mut(&parent) {
            p.children.insert(basename(&full).to_string());
        }
        Tree::fire(&mut t.exist_watches, &full, ZkEventKind::NodeCreated);
        Tree::fire(&mut t.child_watches, &parent, ZkEventKind::NodeChildrenChanged);
        Ok(full)
    }

    async fn set(&self, path: &str, data: &[u8]) -> Result<(), ZkError> {
        let mut t = self.tree.lock();
        t.check(self.session)?;
        let node = t.nodes.get_mut(path).ok_or_else(|| ZkError::NoNode(path.to_string()))?;
        node.data = data.to_vec();
        Tree::fire(&mut t.data_watches, path, ZkEventKind::NodeDataChanged);
        Tree::fire(&mut t.exist_watches, path, ZkEventKind::NodeDataChanged);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), ZkError> {
        let mut t = self.tree.lock();
        t.check(self.session)?;
        match t.nodes.get(path) {
            None => return Err(ZkError::NoNode(path.to_string())),
            Some(n) if !n.children.is_empty() => return Err(ZkError::NotEmpty(path.to_string())),
            Some(_) => {}
        }
        t.remove_node(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn children_watch_fires_on_create() {
        let zk = MemZk::new();
        create_all(&zk, "/bcs/app").await.unwrap();
        let (kids, w) = zk.children_w("/bcs/app").await.unwrap();
        assert!(kids.is_empty());
        zk.create("/bcs/app/ns1", b"", CreateMode::Persistent).await.unwrap();
        let ev = w.await.unwrap();
        assert_eq!(ev.kind, ZkEventKind::NodeChildrenChanged);
        assert_eq!(zk.children("/bcs/app").await.unwrap(), vec!["ns1".to_string()]);
    }

    #[tokio::test]
    async fn sequential_nodes_are_ordered() {
        let zk = MemZk::new();
        create_all(&zk, "/e").await.unwrap();
        let a = zk.create("/e/a-", b"1", CreateMode::EphemeralSequential).await.unwrap();
        let b = zk.create("/e/b-", b"2", CreateMode::EphemeralSequential).await.unwrap();
        assert_eq!(a, "/e/a-0000000000");
        assert_eq!(b, "/e/b-0000000001");
    }

    #[tokio::test]
    async fn expire_removes_ephemerals_and_fails_calls() {
        let zk = MemZk::new();
        create_all(&zk, "/e").await.unwrap();
        let s = zk.session();
        let p = s.create("/e/n-", b"x", CreateMode::EphemeralSequential).await.unwrap();
        let (_, w) = zk.get_w(&p).await.unwrap();
        let (_, mine) = s.children_w("/e").await.unwrap();
        s.expire();
        assert_eq!(w.await.unwrap().kind, ZkEventKind::NodeDeleted);
        assert_eq!(mine.await.unwrap().kind, ZkEventKind::SessionExpired);
        assert!(zk.children("/e").await.unwrap().is_empty());
        assert_eq!(s.get("/e").await, Err(ZkError::SessionExpired));
    }

    #[tokio::test]
    async fn delete_requires_empty_node() {
        let zk = MemZk::new();
        create_all(&zk, "/a/b").await.unwrap();
        assert!(matches!(zk.delete("/a").await, Err(ZkError::NotEmpty(_))));
        zk.delete("/a/b").await.unwrap();
        zk.delete("/a").await.unwrap();
        assert!(!zk.exists("/a").await.unwrap());
    }
}
