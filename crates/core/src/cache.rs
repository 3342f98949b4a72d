//! Keyed, thread-safe object cache and the record type watchers keep in it.

use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

pub type KeyFn<T> = fn(&T) -> String;

/// Map from a computed string key to an object, guarded by one lock.
pub struct ObjectCache<T> {
    key_fn: KeyFn<T>,
    items: RwLock<FxHashMap<String, T>>,
}

impl<T: Clone> ObjectCache<T> {
    pub fn new(key_fn: KeyFn<T>) -> Self { Self { key_fn, items: RwLock::new(FxHashMap::default()) } }

    pub fn key_of(&self, obj: &T) -> String { (self.key_fn)(obj) }

    /// Insert or overwrite; returns the key used.
    pub fn add(&self, obj: T) -> String {
        let key = self.key_of(&obj);
        self.items.write().insert(key.clone(), obj);
        key
    }

    pub fn update(&self, obj: T) -> String { self.add(obj) }

    pub fn delete(&self, obj: &T) -> Option<T> {
        let key = self.key_of(obj);
        self.delete_by_key(&key)
    }

    pub fn delete_by_key(&self, key: &str) -> Option<T> { self.items.write().remove(key) }

    pub fn get(&self, obj: &T) -> Option<T> { self.get_by_key(&self.key_of(obj)) }

    pub fn get_by_key(&self, key: &str) -> Option<T> { self.items.read().get(key).cloned() }

    pub fn list(&self) -> Vec<T> { self.items.read().values().cloned().collect() }

    pub fn list_keys(&self) -> Vec<String> { self.items.read().keys().cloned().collect() }

    pub fn len(&self) -> usize { self.items.read().len() }

    pub fn is_empty(&self) -> bool { self.items.read().is_empty() }

    pub fn clear(&self) { self.items.write().clear(); }

    /// Swap the whole content for `objs`.
    pub fn replace(&self, objs: Vec<T>) {
        let mut next = FxHashMap::default();
        for o in objs {
            next.insert(self.key_of(&o), o);
        }
        *self.items.write() = next;
    }

    /// Run `f` with exclusive access to the underlying map.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut FxHashMap<String, T>) -> R) -> R {
        let mut guard = self.items.write();
        f(&mut guard)
    }
}

/// Cached entity plus its two clocks.
///
/// `sync_time` is the last time the source confirmed the entity, `report_time` the last time a
/// change was forwarded downstream. `seen` is the reconciliation pass that last confirmed it.
#[derive(Debug, Clone)]
pub struct CacheRecord<T> {
    pub data: T,
    pub sync_time: Instant,
    pub report_time: Instant,
    pub seen: u64,
}

impl<T> CacheRecord<T> {
    pub fn new(data: T, now: Instant, seen: u64) -> Self { Self { data, sync_time: now, report_time: now, seen } }

    /// True once nothing has been reported for longer than `after`.
    pub fn is_stale(&self, now: Instant, after: Duration) -> bool { now.saturating_duration_since(self.report_time) > after }
}
