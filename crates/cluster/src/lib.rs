//! datawatch cluster: who is master, and running the watch engine only while we are.

#![forbid(unsafe_code)]

pub mod coordinator;
pub mod discovery;
pub mod lease;

pub use coordinator::{ClusterCoordinator, EngineFactory, EngineHandle, Role};
pub use discovery::{Discovery, DiscoveryError, Registration, ServerInfo, StandaloneDiscovery, ZkDiscovery};
pub use lease::LeaseDiscovery;
