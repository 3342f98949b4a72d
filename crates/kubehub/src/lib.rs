//! datawatch kubehub: the sources of truth a watcher lists and listens to.
//!
//! A [`Source`] answers a full listing on demand and may additionally push [`Change`]s between
//! ticks. Implementations: the ZooKeeper tree ([`ZkTreeSource`]), kube informers
//! ([`InformerSource`]), the netservice IP-pool endpoint ([`NetserviceSource`]) and an in-memory
//! [`MemSource`] for tests and embedding.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use datawatch_core::SyncEntity;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod convert;
pub mod informer;
pub mod mem;
pub mod netservice;
pub mod tree;
pub mod zk;

pub use informer::InformerSource;
pub use mem::MemSource;
pub use netservice::NetserviceSource;
pub use tree::ZkTreeSource;
pub use zk::{create_all, CreateMode, MemZk, ZkClient, ZkError, ZkEvent, ZkEventKind, ZkWatch};

/// A change pushed by a source between reconciliation ticks.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    /// Entity created or modified; keyed by its namespace/name.
    Upsert(T),
    /// Entity with this key is gone.
    Remove(String),
    /// Something changed; run a full pass.
    Resync,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("zookeeper: {0}")]
    Zk(#[from] ZkError),
    #[error("kube: {0}")]
    Kube(#[from] kube::Error),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote returned code {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("decoding {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("source has not completed its initial sync")]
    NotReady,
}

#[async_trait]
pub trait Source<T: SyncEntity>: Send + Sync {
    /// Short human-readable description used in logs.
    fn describe(&self) -> String;

    /// Full listing of the current state.
    async fn list(&self) -> Result<Vec<T>, SourceError>;

    /// Start pushing changes until `cancel` fires. Sources without push support return `None`.
    fn watch(&self, cancel: CancellationToken) -> Option<mpsc::Receiver<Change<T>>> {
        let _ = cancel;
        None
    }
}
