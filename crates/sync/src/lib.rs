//! datawatch sync: reconciliation of source state into sync events.
//!
//! A [`ResourceWatcher`] per resource type diffs source listings against its cache through a
//! [`Reconciler`]; the [`ExportServiceSynthesizer`] derives load-balancer views; the
//! [`WatchEngine`] wires both to the delivery pipeline for one master term.

#![forbid(unsafe_code)]

use datawatch_core::{CoreError, ResourceType};
use datawatch_kubehub::SourceError;

pub mod engine;
pub mod reconcile;
pub mod synth;
pub mod watcher;

pub use engine::{EngineSources, WatchEngine};
pub use reconcile::Reconciler;
pub use synth::ExportServiceSynthesizer;
pub use watcher::{ResourceWatcher, TeeSink};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] CoreError),
    #[error("initial list of {resource} failed: {source}")]
    Bootstrap {
        resource: ResourceType,
        #[source]
        source: SourceError,
    },
}
