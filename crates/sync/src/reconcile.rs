//! Diffing a source listing against the watcher's cache.

use std::time::Duration;

use datawatch_core::{CacheRecord, ObjectCache, SyncAction, SyncEntity, SyncEvent};
use datawatch_kubehub::Change;
use tokio::time::Instant;

fn record_key<T: SyncEntity>(r: &CacheRecord<T>) -> String { r.data.key() }

/// Cache plus pass bookkeeping for one resource type.
///
/// Every full pass bumps the generation; records not confirmed by the pass are evicted.
/// Pushed upserts are stamped with the next generation so a push landing between a listing
/// and its diff is not evicted by that pass.
pub struct Reconciler<T: SyncEntity> {
    cache: ObjectCache<CacheRecord<T>>,
    stale_after: Duration,
    generation: u64,
}

impl<T: SyncEntity> Reconciler<T> {
    pub fn new(stale_after: Duration) -> Self { Self { cache: ObjectCache::new(record_key::<T>), stale_after, generation: 0 } }

    pub fn cache(&self) -> &ObjectCache<CacheRecord<T>> { &self.cache }

    pub fn len(&self) -> usize { self.cache.len() }

    pub fn is_empty(&self) -> bool { self.cache.is_empty() }

    pub fn clear(&self) { self.cache.clear(); }

    /// Full pass over `items`, the complete current state of the source.
    pub fn reconcile(&mut self, items: Vec<T>, now: Instant) -> Vec<SyncEvent> {
        self.generation += 1;
        let gen = self.generation;
        let stale_after = self.stale_after;
        self.cache.mutate(|map| {
            let mut events = Vec::new();
            for item in items {
                let key = item.key();
                match map.get_mut(&key) {
                    None => {
                        map.insert(key, CacheRecord::new(item.clone(), now, gen));
                        events.push(SyncEvent::of(SyncAction::Add, item));
                    }
                    Some(rec) => {
                        rec.sync_time = now;
                        rec.seen = rec.seen.max(gen);
                        if rec.data != item {
                            rec.data = item.clone();
                            rec.report_time = now;
                            events.push(SyncEvent::of(SyncAction::Update, item));
                        } else if rec.is_stale(now, stale_after) {
                            rec.report_time = now;
                            events.push(SyncEvent::of(SyncAction::Update, item));
                        }
                    }
                }
            }
            let gone: Vec<String> = map.iter().filter(|(_, r)| r.seen < gen).map(|(k, _)| k.clone()).collect();
            for key in gone {
                if let Some(rec) = map.remove(&key) {
                    events.push(SyncEvent::of(SyncAction::Delete, rec.data));
                }
            }
            events
        })
    }

    /// Apply a pushed change. `Resync` yields nothing; the caller runs a full pass instead.
    pub fn apply(&mut self, change: Change<T>, now: Instant) -> Vec<SyncEvent> {
        let next = self.generation + 1;
        match change {
            Change::Upsert(item) => self.cache.mutate(|map| {
                let key = item.key();
                match map.get_mut(&key) {
                    None => {
                        map.insert(key, CacheRecord::new(item.clone(), now, next));
                        vec![SyncEvent::of(SyncAction::Add, item)]
                    }
                    Some(rec) => {
                        rec.sync_time = now;
                        rec.seen = next;
                        if rec.data == item {
                            return Vec::new();
                        }
                        rec.data = item.clone();
                        rec.report_time = now;
                        vec![SyncEvent::of(SyncAction::Update, item)]
                    }
                }
            }),
            Change::Remove(key) => match self.cache.delete_by_key(&key) {
                Some(rec) => vec![SyncEvent::of(SyncAction::Delete, rec.data)],
                None => Vec::new(),
            },
            Change::Resync => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datawatch_core::{ConfigMap, ObjectMeta};
    use serde_json::Map;

    fn cm(name: &str, v: &str) -> ConfigMap {
        let mut extra = Map::new();
        extra.insert("data".into(), serde_json::json!({ "k": v }));
        ConfigMap { metadata: ObjectMeta::new("ns", name), extra }
    }

    fn actions(evs: &[SyncEvent]) -> Vec<(SyncAction, String)> { evs.iter().map(|e| (e.action, e.key())).collect() }

    #[tokio::test(start_paused = true)]
    async fn reconcile_is_idempotent() {
        let mut r = Reconciler::new(Duration::from_secs(300));
        let now = Instant::now();
        let first = r.reconcile(vec![cm("a", "1"), cm("b", "1")], now);
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|e| e.action == SyncAction::Add));
        assert!(r.reconcile(vec![cm("a", "1"), cm("b", "1")], now).is_empty());
        assert_eq!(r.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn changed_item_emits_update() {
        let mut r = Reconciler::new(Duration::from_secs(300));
        r.reconcile(vec![cm("a", "1")], Instant::now());
        let evs = r.reconcile(vec![cm("a", "2")], Instant::now());
        assert_eq!(actions(&evs), vec![(SyncAction::Update, "ns/a".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_item_is_deleted_exactly_once() {
        let mut r = Reconciler::new(Duration::from_secs(300));
        r.reconcile(vec![cm("a", "1"), cm("b", "1")], Instant::now());
        let evs = r.reconcile(vec![cm("a", "1")], Instant::now());
        assert_eq!(actions(&evs), vec![(SyncAction::Delete, "ns/b".to_string())]);
        assert!(r.reconcile(vec![cm("a", "1")], Instant::now()).is_empty());
        assert!(r.cache().get_by_key("ns/b").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_item_is_reasserted_after_staleness() {
        let mut r = Reconciler::new(Duration::from_secs(10));
        r.reconcile(vec![cm("a", "1")], Instant::now());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(r.reconcile(vec![cm("a", "1")], Instant::now()).is_empty());
        tokio::time::advance(Duration::from_secs(6)).await;
        let evs = r.reconcile(vec![cm("a", "1")], Instant::now());
        assert_eq!(actions(&evs), vec![(SyncAction::Update, "ns/a".to_string())]);
        // report time moved; no second heartbeat right away
        assert!(r.reconcile(vec![cm("a", "1")], Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pushed_upsert_survives_the_next_pass() {
        let mut r = Reconciler::new(Duration::from_secs(300));
        r.reconcile(vec![cm("a", "1")], Instant::now());
        let evs = r.apply(Change::Upsert(cm("b", "1")), Instant::now());
        assert_eq!(actions(&evs), vec![(SyncAction::Add, "ns/b".to_string())]);
        // listing taken before the push does not contain b
        assert!(r.reconcile(vec![cm("a", "1")], Instant::now()).is_empty());
        // the pass after that does evict it
        let evs = r.reconcile(vec![cm("a", "1")], Instant::now());
        assert_eq!(actions(&evs), vec![(SyncAction::Delete, "ns/b".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn pushed_changes_are_idempotent_and_removals_immediate() {
        let mut r = Reconciler::new(Duration::from_secs(300));
        assert_eq!(r.apply(Change::Upsert(cm("a", "1")), Instant::now()).len(), 1);
        assert!(r.apply(Change::Upsert(cm("a", "1")), Instant::now()).is_empty());
        let evs = r.apply(Change::Remove("ns/a".into()), Instant::now());
        assert_eq!(actions(&evs), vec![(SyncAction::Delete, "ns/a".to_string())]);
        assert!(r.apply(Change::Remove("ns/a".into()), Instant::now()).is_empty());
        assert!(r.apply(Change::Resync, Instant::now()).is_empty());
    }
}
