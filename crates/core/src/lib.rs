//! datawatch core types
//!
//! Entities observed in the orchestrator, the `SyncEvent` unit of work, the keyed
//! `ObjectCache`, the shard planner used to route events, and the explicit `WatchConfig`
//! handed to every component.

#![forbid(unsafe_code)]

pub mod cache;
pub mod config;
pub mod entity;
pub mod error;
pub mod event;
pub mod shard;

pub use cache::{CacheRecord, ObjectCache};
pub use config::{ResourceTiming, WatchConfig};
pub use entity::{
    entity_key, Application, Backend, ConfigMap, Deployment, Endpoint, Entity, ExportPort, ExportService, IpPool,
    NetworkMode, ObjectMeta, PortMapping, ResourceType, Secret, Service, ServicePort, SyncEntity, Task, TaskGroup,
};
pub use error::CoreError;
pub use event::{SyncAction, SyncEvent};
pub use shard::{fnv1a, ModuloKeyPlanner, ShardKey, ShardPlanner};

pub mod prelude {
    pub use super::{CacheRecord, Entity, ObjectCache, ResourceType, SyncAction, SyncEntity, SyncEvent, WatchConfig};
}
