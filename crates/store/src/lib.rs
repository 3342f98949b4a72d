//! datawatch store: routing, queueing and delivering sync events to the storage API.
//!
//! Events are routed to a named channel ([`EventRouter`]), queued with a bounded wait
//! ([`DeliveryChannel::enqueue`]) and delivered by one consumer per channel through a
//! [`StorageClient`]. Per-key ordering follows from every key mapping to exactly one channel.

#![forbid(unsafe_code)]

pub mod client;
pub mod memory;
pub mod pipeline;
pub mod router;
pub mod sweep;
pub mod tasks;

pub use client::{entity_url, sweep_url, HttpStorage, StorageClient, StorageConfig, StorageError};
pub use memory::{MemoryStorage, StoredOp};
pub use pipeline::{deliver, DeliveryChannel, DeliveryPipeline, Enqueue};
pub use router::{EventRouter, EventSink};
pub use tasks::TaskCounter;
