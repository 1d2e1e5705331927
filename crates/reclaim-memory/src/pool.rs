//! Keyed caches of opaque, sized resources.
//!
//! A [`ResourcePool`] owns its entries outright; nothing outside the pool
//! holds a reference to an entry, only lookups by key. Values are handed out
//! by clone, so pools meant to share large payloads should store them behind
//! `Arc` (clone-on-read then yields a shared immutable handle). Eviction only
//! drops the pool's reference; values already handed out stay alive.
//!
//! Every operation on a pool is serialized behind one lock (`get` refreshes
//! the access time, so even reads write). Pools are independent: work on one
//! never blocks another.

use crate::cleanup::{CleanupContext, CleanupHandler, CleanupResult};
use crate::clock::{Clock, SystemClock};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Sizing and idle policy for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub capacity_bytes: u64,
    /// Entries idle for longer than this are released under normal cleanup.
    pub idle_window: Duration,
    /// Tighter idle window used under `Critical`/`Emergency` pressure.
    pub aggressive_idle_window: Duration,
}

impl PoolConfig {
    pub fn with_capacity(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            ..Self::default()
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 64 * crate::MB,
            idle_window: Duration::from_secs(300),
            aggressive_idle_window: Duration::from_secs(30),
        }
    }
}

/// Point-in-time counters for a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub name: String,
    pub entries: usize,
    pub usage_bytes: u64,
    pub capacity_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct ResourceEntry<V> {
    value: V,
    size_bytes: u64,
    last_access: Instant,
    /// Position in the LRU index. Strictly increasing across touches, so it
    /// breaks ties between identical access times in touch order.
    seq: u64,
}

struct PoolInner<V> {
    entries: HashMap<String, ResourceEntry<V>>,
    lru: BTreeMap<u64, String>,
    next_seq: u64,
    usage_bytes: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<V> PoolInner<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            next_seq: 0,
            usage_bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn remove(&mut self, key: &str) -> Option<ResourceEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.lru.remove(&entry.seq);
        self.usage_bytes = self.usage_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn pop_lru(&mut self) -> Option<(String, ResourceEntry<V>)> {
        let (_, key) = self.lru.pop_first()?;
        let entry = self.entries.remove(&key)?;
        self.usage_bytes = self.usage_bytes.saturating_sub(entry.size_bytes);
        Some((key, entry))
    }
}

/// A capacity-bounded LRU cache of opaque resources.
pub struct ResourcePool<V> {
    name: String,
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<PoolInner<V>>,
}

impl<V> ResourcePool<V> {
    pub fn new(name: impl Into<String>, capacity_bytes: u64) -> Self {
        Self::with_clock(
            name,
            PoolConfig::with_capacity(capacity_bytes),
            Arc::new(SystemClock),
        )
    }

    pub fn with_clock(name: impl Into<String>, config: PoolConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(PoolInner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.config.capacity_bytes
    }

    pub fn usage_bytes(&self) -> u64 {
        self.inner.lock().usage_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is cached, without refreshing its access time.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Insert or overwrite `key`. If the pool ends up over capacity, least
    /// recently used entries are evicted before returning.
    ///
    /// A single resource larger than the whole capacity is kept as the sole
    /// entry rather than dropped.
    pub fn store(&self, key: impl Into<String>, value: V, size_bytes: u64) {
        let key = key.into();
        let mut inner = self.inner.lock();
        // Read the clock under the lock so access times follow `seq` order.
        let now = self.clock.now();

        inner.remove(&key);
        let seq = inner.bump_seq();
        inner.lru.insert(seq, key.clone());
        inner.entries.insert(
            key.clone(),
            ResourceEntry {
                value,
                size_bytes,
                last_access: now,
                seq,
            },
        );
        inner.usage_bytes = inner.usage_bytes.saturating_add(size_bytes);

        if inner.usage_bytes > self.config.capacity_bytes {
            self.evict_over_capacity(&mut inner, &key);
        }
    }

    fn evict_over_capacity(&self, inner: &mut PoolInner<V>, stored_key: &str) {
        let mut freed = 0u64;
        let mut evicted = 0u64;
        // The entry just stored has the newest sequence number, so it is the
        // last candidate and survives when it is alone.
        while inner.usage_bytes > self.config.capacity_bytes && inner.entries.len() > 1 {
            let Some((key, entry)) = inner.pop_lru() else {
                break;
            };
            freed = freed.saturating_add(entry.size_bytes);
            evicted += 1;
            tracing::trace!(
                target: "reclaim.memory",
                pool = %self.name,
                key = %key,
                size_bytes = entry.size_bytes,
                "evicted least recently used entry"
            );
        }
        inner.evictions = inner.evictions.saturating_add(evicted);

        if inner.usage_bytes > self.config.capacity_bytes {
            tracing::warn!(
                target: "reclaim.memory",
                pool = %self.name,
                key = %stored_key,
                size_bytes = inner.usage_bytes,
                capacity_bytes = self.config.capacity_bytes,
                "resource alone exceeds pool capacity; keeping it as the only entry"
            );
        } else if evicted > 0 {
            tracing::debug!(
                target: "reclaim.memory",
                pool = %self.name,
                evicted,
                freed_bytes = freed,
                "capacity eviction pass"
            );
        }
    }

    /// Drop `key` if present, returning its value.
    pub fn remove(&self, key: &str) -> Option<V> {
        self.inner.lock().remove(key).map(|entry| entry.value)
    }

    /// Remove every entry last accessed strictly before `older_than`.
    /// Returns the bytes freed.
    pub fn release_unused(&self, older_than: Instant) -> u64 {
        let mut inner = self.inner.lock();
        let stale: Vec<String> = inner
            .lru
            .values()
            .filter(|key| {
                inner
                    .entries
                    .get(key.as_str())
                    .is_some_and(|entry| entry.last_access < older_than)
            })
            .cloned()
            .collect();

        let mut freed = 0u64;
        let mut released = 0u64;
        for key in &stale {
            if let Some(entry) = inner.remove(key) {
                freed = freed.saturating_add(entry.size_bytes);
                released += 1;
            }
        }
        inner.evictions = inner.evictions.saturating_add(released);
        drop(inner);

        if released > 0 {
            tracing::debug!(
                target: "reclaim.memory",
                pool = %self.name,
                released,
                freed_bytes = freed,
                "released idle entries"
            );
        }
        freed
    }

    /// Release entries idle for longer than the configured idle window.
    pub fn release_idle(&self) -> u64 {
        self.release_idle_for(self.config.idle_window)
    }

    /// Like [`Self::release_idle`] with the tighter aggressive window.
    pub fn aggressive_cleanup(&self) -> u64 {
        self.release_idle_for(self.config.aggressive_idle_window)
    }

    fn release_idle_for(&self, window: Duration) -> u64 {
        match self.clock.now().checked_sub(window) {
            Some(cutoff) => self.release_unused(cutoff),
            // Nothing can have been idle longer than the clock has existed.
            None => 0,
        }
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let dropped = inner.entries.len() as u64;
        let freed = inner.usage_bytes;
        inner.entries.clear();
        inner.lru.clear();
        inner.usage_bytes = 0;
        inner.evictions = inner.evictions.saturating_add(dropped);
        drop(inner);

        tracing::debug!(
            target: "reclaim.memory",
            pool = %self.name,
            dropped,
            freed_bytes = freed,
            "cleared pool"
        );
    }

    /// Release spare bookkeeping capacity. Entries are untouched.
    pub fn compact(&self) {
        let mut inner = self.inner.lock();
        inner.entries.shrink_to_fit();
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            name: self.name.clone(),
            entries: inner.entries.len(),
            usage_bytes: inner.usage_bytes,
            capacity_bytes: self.config.capacity_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}

impl<V: Clone> ResourcePool<V> {
    /// Look up `key`, refreshing its access time on a hit.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        let next_seq = inner.next_seq;
        let Some(entry) = inner.entries.get_mut(key) else {
            inner.misses += 1;
            return None;
        };
        let previous_seq = std::mem::replace(&mut entry.seq, next_seq);
        entry.last_access = now;
        let value = entry.value.clone();

        inner.next_seq += 1;
        inner.lru.remove(&previous_seq);
        inner.lru.insert(next_seq, key.to_string());
        inner.hits += 1;
        Some(value)
    }
}

impl<V: Send + 'static> ResourcePool<V> {
    /// A cleanup handler that releases idle entries from this pool. It holds
    /// only a weak reference, so registering it does not keep the pool alive.
    pub fn cleanup_handler(self: &Arc<Self>) -> Arc<dyn CleanupHandler> {
        let pool: Weak<dyn ManagedPool> = Arc::downgrade(self) as Weak<dyn ManagedPool>;
        Arc::new(PoolCleanupHandler { pool })
    }
}

impl<V> std::fmt::Debug for ResourcePool<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ResourcePool")
            .field("name", &self.name)
            .field("entries", &inner.entries.len())
            .field("usage_bytes", &inner.usage_bytes)
            .field("capacity_bytes", &self.config.capacity_bytes)
            .finish()
    }
}

/// Type-erased view of a pool, used by the composition root and the
/// last-resort path to treat pools of different value types uniformly.
pub trait ManagedPool: Send + Sync {
    fn name(&self) -> &str;
    fn usage_bytes(&self) -> u64;
    fn capacity_bytes(&self) -> u64;
    fn stats(&self) -> PoolStats;
    fn release_idle(&self) -> u64;
    fn aggressive_cleanup(&self) -> u64;
    fn clear(&self);
    fn compact(&self);
}

impl<V: Send + 'static> ManagedPool for ResourcePool<V> {
    fn name(&self) -> &str {
        ResourcePool::name(self)
    }

    fn usage_bytes(&self) -> u64 {
        ResourcePool::usage_bytes(self)
    }

    fn capacity_bytes(&self) -> u64 {
        ResourcePool::capacity_bytes(self)
    }

    fn stats(&self) -> PoolStats {
        ResourcePool::stats(self)
    }

    fn release_idle(&self) -> u64 {
        ResourcePool::release_idle(self)
    }

    fn aggressive_cleanup(&self) -> u64 {
        ResourcePool::aggressive_cleanup(self)
    }

    fn clear(&self) {
        ResourcePool::clear(self)
    }

    fn compact(&self) {
        ResourcePool::compact(self)
    }
}

struct PoolCleanupHandler {
    pool: Weak<dyn ManagedPool>,
}

#[async_trait]
impl CleanupHandler for PoolCleanupHandler {
    async fn run(&self, ctx: CleanupContext) -> CleanupResult {
        let Some(pool) = self.pool.upgrade() else {
            return CleanupResult::freed(0).with_metadata("pool_dropped", true);
        };

        let freed = if ctx.is_aggressive() {
            pool.aggressive_cleanup()
        } else {
            pool.release_idle()
        };
        pool.compact();

        CleanupResult::freed(freed).with_metadata("pool", pool.name())
    }
}
