//! Live-task accounting for everything one watch graph spawns.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

/// Cloneable count of tasks spawned through it that have not finished yet.
#[derive(Debug, Clone, Default)]
pub struct TaskCounter(Arc<AtomicUsize>);

struct Live(Arc<AtomicUsize>);

impl Drop for Live {
    fn drop(&mut self) { self.0.fetch_sub(1, Ordering::SeqCst); }
}

impl TaskCounter {
    pub fn new() -> Self { Self::default() }

    pub fn live(&self) -> usize { self.0.load(Ordering::SeqCst) }

    /// Spawn `fut`; it counts as live from now until it returns or is dropped.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.0.fetch_add(1, Ordering::SeqCst);
        let live = Live(self.0.clone());
        tokio::spawn(async move {
            let _live = live;
            fut.await
        })
    }
}
