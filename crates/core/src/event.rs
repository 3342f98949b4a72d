//! The unit of work flowing from watchers to delivery.

use serde::Serialize;

use crate::entity::{Entity, ResourceType, SyncEntity};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
pub enum SyncAction {
    Add,
    Update,
    Delete,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Add => "Add",
            SyncAction::Update => "Update",
            SyncAction::Delete => "Delete",
        }
    }
}

/// One change to forward downstream. Never mutated after creation; a retry re-derives a new event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncEvent {
    pub resource: ResourceType,
    pub action: SyncAction,
    pub item: Entity,
}

impl SyncEvent {
    pub fn new(action: SyncAction, item: Entity) -> Self { Self { resource: item.resource(), action, item } }

    pub fn of<T: SyncEntity>(action: SyncAction, item: T) -> Self { Self::new(action, item.into_entity()) }

    pub fn key(&self) -> String { self.item.key() }
}
