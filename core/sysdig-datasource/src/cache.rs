//! Small in-memory cache with age-based expiration, recency-based eviction
//! and deduplication of concurrent loads.
//!
//! The cache is meant for a handful of lookups (metric descriptors, label lists, ...),
//! not for bulk data: every operation is linear in the number of items.

use std::{
    future::Future,
    hash::Hash,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use indexmap::IndexMap;

/// Source of the current time, in milliseconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// Wall-clock time since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self(AtomicU64::new(now))
    }

    pub fn set(&self, now: u64) {
        self.0.store(now, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

type PendingLoad<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

#[derive(Clone)]
enum Slot<V, E> {
    /// A load is in progress, every reader waits for the same result.
    Loading(u64, PendingLoad<V, E>),
    Ready(V),
}

struct CacheItem<V, E> {
    slot: Slot<V, E>,
    created_at: u64,
}

/// Bounded key-value cache.
///
/// - Items older than `expiration` (counted from their last write) are dropped
///   lazily, on the next read or write.
/// - When there are more than `max_count` items, the least recently used ones are dropped.
/// - Concurrent [`get_or_load`](Self::get_or_load) calls for the same key share one load.
///   A failed load is not cached.
pub struct Cache<K, V, E> {
    /// Ordered by recency: the most recently touched item is the last one.
    items: Mutex<IndexMap<K, CacheItem<V, E>>>,
    max_count: usize,
    expiration: Option<u64>,
    clock: Arc<dyn Clock>,
    next_load_id: AtomicU64,
}

enum Lookup<V, E> {
    Hit(V),
    Wait(PendingLoad<V, E>),
    Load(u64, PendingLoad<V, E>),
}

/// Removes the placeholder of a load when its leading caller goes away without storing a value,
/// because the load failed or because the caller was cancelled.
struct PlaceholderGuard<'a, K: Hash + Eq, V, E> {
    items: &'a Mutex<IndexMap<K, CacheItem<V, E>>>,
    key: K,
    load_id: u64,
}

impl<K: Hash + Eq, V, E> Drop for PlaceholderGuard<'_, K, V, E> {
    fn drop(&mut self) {
        let Ok(mut items) = self.items.lock() else {
            return;
        };
        if let Some(CacheItem {
            slot: Slot::Loading(id, _),
            ..
        }) = items.get(&self.key)
        {
            if *id == self.load_id {
                items.shift_remove(&self.key);
            }
        }
    }
}

impl<K, V, E> Cache<K, V, E>
where
    K: Hash + Eq + Clone,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub const DEFAULT_MAX_COUNT: usize = 10;

    /// Creates a cache that uses the wall clock. `expiration: None` means that items never expire.
    pub fn new(max_count: usize, expiration: Option<Duration>) -> Self {
        Self::with_clock(max_count, expiration, Arc::new(SystemClock))
    }

    pub fn with_clock(max_count: usize, expiration: Option<Duration>, clock: Arc<dyn Clock>) -> Self {
        Self {
            items: Mutex::new(IndexMap::new()),
            max_count,
            expiration: expiration.map(|d| d.as_millis() as u64),
            clock,
            next_load_id: AtomicU64::new(0),
        }
    }

    /// Returns the value stored for `key`, waiting for it if it is being loaded.
    ///
    /// Returns `None` if the key is not in the cache.
    pub async fn get(&self, key: &K) -> Option<Result<V, E>> {
        let slot = {
            let mut items = self.items.lock().unwrap();
            let now = self.clock.now();
            self.read(&mut items, key, now)?
        };
        match slot {
            Slot::Ready(value) => Some(Ok(value)),
            Slot::Loading(_, pending) => Some(pending.await),
        }
    }

    /// Returns the value stored for `key`, or loads it with `loader`.
    ///
    /// While the load is in progress, other calls for the same key wait for it instead of
    /// calling their own loader. If the load fails, nothing is stored and every waiting
    /// caller gets the error. If the caller that started the load is dropped, the load is
    /// forgotten: the callers already waiting still get its result, the next ones load again.
    pub async fn get_or_load<F, Fut>(&self, key: K, loader: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let lookup = {
            let mut items = self.items.lock().unwrap();
            let now = self.clock.now();
            match self.read(&mut items, &key, now) {
                Some(Slot::Ready(value)) => Lookup::Hit(value),
                Some(Slot::Loading(_, pending)) => Lookup::Wait(pending),
                None => {
                    let load_id = self.next_load_id.fetch_add(1, Ordering::Relaxed);
                    let pending = loader().boxed().shared();
                    // store the pending load first, so that concurrent readers find it
                    self.write(&mut items, key.clone(), Slot::Loading(load_id, pending.clone()), now);
                    Lookup::Load(load_id, pending)
                }
            }
        };

        match lookup {
            Lookup::Hit(value) => Ok(value),
            Lookup::Wait(pending) => pending.await,
            Lookup::Load(load_id, pending) => {
                let _guard = PlaceholderGuard {
                    items: &self.items,
                    key: key.clone(),
                    load_id,
                };
                let result = pending.await;
                if let Ok(value) = &result {
                    let mut items = self.items.lock().unwrap();
                    let now = self.clock.now();
                    self.write(&mut items, key, Slot::Ready(value.clone()), now);
                }
                result
            }
        }
    }

    /// Returns the loaded values, from the least recently used to the most recently used.
    pub fn values(&self) -> Vec<V> {
        let items = self.items.lock().unwrap();
        items
            .values()
            .filter_map(|item| match &item.slot {
                Slot::Ready(value) => Some(value.clone()),
                Slot::Loading(..) => None,
            })
            .collect()
    }

    /// Number of items, including the ones being loaded.
    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self, items: &mut IndexMap<K, CacheItem<V, E>>, key: &K, now: u64) -> Option<Slot<V, E>> {
        self.expire_items(items, now);
        let item = items.shift_remove(key)?;
        let slot = item.slot.clone();
        // re-insert at the end: most recently used
        items.insert(key.clone(), item);
        Some(slot)
    }

    fn write(&self, items: &mut IndexMap<K, CacheItem<V, E>>, key: K, slot: Slot<V, E>, now: u64) {
        // replace the previous item, if any (e.g. a pending load replaced by its value)
        items.shift_remove(&key);
        items.insert(
            key,
            CacheItem {
                slot,
                created_at: now,
            },
        );
        self.expire_items(items, now);
        self.evict_items(items);
    }

    fn expire_items(&self, items: &mut IndexMap<K, CacheItem<V, E>>, now: u64) {
        if let Some(expiration) = self.expiration {
            let limit = now.saturating_sub(expiration);
            items.retain(|_, item| item.created_at >= limit);
        }
    }

    fn evict_items(&self, items: &mut IndexMap<K, CacheItem<V, E>>) {
        if items.len() > self.max_count {
            let excess = items.len() - self.max_count;
            items.drain(..excess);
        }
    }
}

impl<K, V, E> Default for Cache<K, V, E>
where
    K: Hash + Eq + Clone,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_COUNT, None)
    }
}
