//! Master/slave election loop gating the watch engine.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use datawatch_kubehub::ZkError;
use datawatch_sync::WatchEngine;
use metrics::gauge;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::discovery::{Discovery, DiscoveryError, ServerInfo};

const POLL: Duration = Duration::from_secs(5);
const BACKOFF: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Init,
    Master,
    Slave,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Init => "init",
            Role::Master => "master",
            Role::Slave => "slave",
        })
    }
}

/// A started watch graph that can be torn down.
#[async_trait]
pub trait EngineHandle: Send {
    /// Returns once every task of the graph has exited.
    async fn shutdown(self: Box<Self>);
}

#[async_trait]
impl EngineHandle for WatchEngine {
    async fn shutdown(self: Box<Self>) { WatchEngine::shutdown(*self).await }
}

/// Builds a fresh engine for each master term.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// `cancel` is the term token; the engine must stop when it fires.
    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<Box<dyn EngineHandle>>;
}

struct State {
    role: Role,
    servers: Vec<ServerInfo>,
    registration: Option<String>,
}

struct Term {
    cancel: CancellationToken,
    engine: Box<dyn EngineHandle>,
}

enum StepError {
    Discovery(DiscoveryError),
    Engine(anyhow::Error),
}

pub struct ClusterCoordinator {
    me: ServerInfo,
    discovery: Arc<dyn Discovery>,
    factory: Arc<dyn EngineFactory>,
    state: Mutex<State>,
    poll: Duration,
    backoff: Duration,
}

impl ClusterCoordinator {
    pub fn new(me: ServerInfo, discovery: Arc<dyn Discovery>, factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            me,
            discovery,
            factory,
            state: Mutex::new(State { role: Role::Init, servers: Vec::new(), registration: None }),
            poll: POLL,
            backoff: BACKOFF,
        }
    }

    pub fn with_intervals(mut self, poll: Duration, backoff: Duration) -> Self {
        self.poll = poll;
        self.backoff = backoff;
        self
    }

    pub fn role(&self) -> Role { self.state.lock().role }

    /// Candidates as last discovered, master first.
    pub fn servers(&self) -> Vec<ServerInfo> { self.state.lock().servers.clone() }

    pub fn registration(&self) -> Option<String> { self.state.lock().registration.clone() }

    fn set_role(&self, role: Role) {
        let prev = std::mem::replace(&mut self.state.lock().role, role);
        if prev != role {
            info!(cluster = %self.me.cluster, from = %prev, to = %role, "role changed");
        }
        let v = match role {
            Role::Master => 1.0,
            Role::Slave => 0.0,
            Role::Init => -1.0,
        };
        gauge!("datawatch_role", v, "cluster" => self.me.cluster.clone());
    }

    /// Elect until `cancel` fires. Fails only when an engine cannot be started.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut term: Option<Term> = None;
        info!(cluster = %self.me.cluster, address = %self.me.address(), "coordinator started");
        let result = loop {
            let wait = match self.step(&mut term, &cancel).await {
                Ok(()) => self.poll,
                Err(StepError::Discovery(e)) => {
                    warn!(cluster = %self.me.cluster, error = %e, "discovery failed; backing off");
                    self.teardown(&mut term).await;
                    // Only a vanished node needs a new one; otherwise ours still holds its place.
                    if matches!(e, DiscoveryError::Lost(_) | DiscoveryError::Zk(ZkError::SessionExpired)) {
                        self.state.lock().registration = None;
                    }
                    self.set_role(Role::Init);
                    self.backoff
                }
                Err(StepError::Engine(e)) => {
                    error!(cluster = %self.me.cluster, error = %e, "engine start failed");
                    break Err(e);
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }
        };
        self.teardown(&mut term).await;
        self.set_role(Role::Init);
        info!(cluster = %self.me.cluster, "coordinator stopped");
        result
    }

    async fn step(&self, term: &mut Option<Term>, cancel: &CancellationToken) -> Result<(), StepError> {
        let registration = match self.registration() {
            Some(id) => id,
            None => {
                let id = self.discovery.register(&self.me).await.map_err(StepError::Discovery)?;
                self.state.lock().registration = Some(id.clone());
                id
            }
        };
        let servers = self.discovery.servers().await.map_err(StepError::Discovery)?;
        if !servers.iter().any(|r| r.id == registration) {
            return Err(StepError::Discovery(DiscoveryError::Lost(registration)));
        }
        let master = servers.first().is_some_and(|r| r.id == registration);
        self.state.lock().servers = servers.into_iter().map(|r| r.info).collect();

        match (master, term.is_some()) {
            (true, false) => {
                let token = cancel.child_token();
                let engine = self.factory.start(token.clone()).await.map_err(StepError::Engine)?;
                *term = Some(Term { cancel: token, engine });
                self.set_role(Role::Master);
            }
            (false, true) => {
                self.teardown(term).await;
                self.set_role(Role::Slave);
            }
            (false, false) => self.set_role(Role::Slave),
            (true, true) => {}
        }
        Ok(())
    }

    async fn teardown(&self, term: &mut Option<Term>) {
        if let Some(t) = term.take() {
            info!(cluster = %self.me.cluster, "stopping watch engine");
            t.cancel.cancel();
            t.engine.shutdown().await;
        }
    }
}
