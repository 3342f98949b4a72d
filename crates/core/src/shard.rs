//! Shard selection: which delivery channel an event lands on.

use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::entity::ResourceType;

/// 64-bit FNV-1a; stable across runs and processes.
pub fn fnv1a(s: &str) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325; // 64-bit FNV-1a offset
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

/// Shard selection key composed from the resource type and an optional bucket.
///
/// `bucket` is `None` for singleton resource types, which own exactly one channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ShardKey {
    pub resource: ResourceType,
    pub bucket: Option<u16>,
}

impl ShardKey {
    pub fn channel_name(&self) -> String { self.to_string() }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bucket {
            Some(b) => write!(f, "{}_{}", self.resource.as_str(), b),
            None => f.write_str(self.resource.as_str()),
        }
    }
}

/// Planner responsible for mapping an entity into a shard key.
pub trait ShardPlanner: Send + Sync {
    fn plan(&self, resource: ResourceType, entity_key: &str) -> ShardKey;

    /// Every channel this planner can produce for `resource`.
    fn channels(&self, resource: ResourceType) -> Vec<ShardKey>;
}

/// Default planner: modulo bucketing of the entity key for sharded types.
#[derive(Debug, Clone, Default)]
pub struct ModuloKeyPlanner {
    buckets: FxHashMap<ResourceType, u16>,
}

impl ModuloKeyPlanner {
    pub fn new() -> Self { Self::default() }

    pub fn with_buckets(mut self, resource: ResourceType, buckets: usize) -> Self {
        self.buckets.insert(resource, buckets.clamp(1, u16::MAX as usize) as u16);
        self
    }

    pub fn buckets(&self, resource: ResourceType) -> Option<u16> {
        if resource.is_sharded() { Some(self.buckets.get(&resource).copied().unwrap_or(1)) } else { None }
    }
}

impl ShardPlanner for ModuloKeyPlanner {
    fn plan(&self, resource: ResourceType, entity_key: &str) -> ShardKey {
        let bucket = self.buckets(resource).map(|n| if n <= 1 { 0 } else { (fnv1a(entity_key) % n as u64) as u16 });
        ShardKey { resource, bucket }
    }

    fn channels(&self, resource: ResourceType) -> Vec<ShardKey> {
        match self.buckets(resource) {
            Some(n) => (0..n).map(|b| ShardKey { resource, bucket: Some(b) }).collect(),
            None => vec![ShardKey { resource, bucket: None }],
        }
    }
}
