use crate::entry::CachedEntry;
use crate::key::CacheKey;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Number of shards. Must be a power of two for fast modulo via bitmask.
const NUM_SHARDS: usize = 64;
const SHARD_MASK: u64 = (NUM_SHARDS as u64) - 1;

/// Snapshot of store statistics.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub current_size: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        }
    }
}

/// Key-value store shared by every subsystem that caches upstream bodies.
///
/// Reads and writes are synchronous: a lookup must never wait on I/O.
/// Entries leave the store by expiry or capacity pressure only.
pub trait CacheStore: Send + Sync {
    /// Return the entry for `key` unless it is missing or past its lifetime.
    fn get(&self, key: &CacheKey) -> Option<Arc<CachedEntry>>;

    /// Insert or replace the entry stored under `entry.key`.
    fn set(&self, entry: CachedEntry);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable name of the backend.
    fn name(&self) -> &'static str;

    fn stats(&self) -> CacheStats;
}

struct Shard {
    map: RwLock<HashMap<CacheKey, Arc<CachedEntry>>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl Shard {
    fn new(capacity: usize) -> Self {
        Self {
            map: RwLock::new(HashMap::with_capacity(capacity)),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn get(&self, key: &CacheKey) -> Option<Arc<CachedEntry>> {
        let expired = {
            let map = self.map.read();
            match map.get(key) {
                Some(entry) if !entry.is_expired() => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(Arc::clone(entry));
                }
                Some(_) => true,
                None => false,
            }
        };

        self.misses.fetch_add(1, Ordering::Relaxed);
        if expired {
            let mut map = self.map.write();
            // Another writer may have refreshed it between the two locks.
            if map.get(key).is_some_and(|e| e.is_expired()) {
                map.remove(key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        None
    }

    fn set(&self, entry: CachedEntry) {
        let mut map = self.map.write();

        if !map.contains_key(&entry.key) && map.len() >= self.capacity {
            let before = map.len();
            map.retain(|_, e| !e.is_expired());
            let mut evicted = (before - map.len()) as u64;

            while map.len() >= self.capacity {
                let oldest = map
                    .iter()
                    .min_by_key(|(_, e)| e.fetched_at)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        map.remove(&k);
                        evicted += 1;
                    }
                    None => break,
                }
            }
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
        }

        map.insert(entry.key.clone(), Arc::new(entry));
    }

    fn len(&self) -> usize {
        self.map.read().len()
    }
}

/// Process-wide in-memory store.
///
/// Keys are spread over 64 independent shards, each behind its own `RwLock`,
/// so hits on different keys never contend. Shard selection uses `ahash` with
/// fixed seeds. When a shard is full it first drops expired entries, then the
/// entry fetched longest ago.
pub struct MemoryStore {
    shards: Box<[Shard]>,
}

impl MemoryStore {
    /// Create a store holding roughly `total_capacity` entries
    /// (`total_capacity / 64` per shard, minimum 1).
    pub fn new(total_capacity: usize) -> Self {
        let per_shard = (total_capacity / NUM_SHARDS).max(1);
        let shards = (0..NUM_SHARDS).map(|_| Shard::new(per_shard)).collect();
        Self { shards }
    }

    #[inline]
    fn shard(&self, key: &CacheKey) -> &Shard {
        let hash = ahash::RandomState::with_seeds(1, 2, 3, 4).hash_one(key);
        &self.shards[(hash & SHARD_MASK) as usize]
    }

    pub fn capacity(&self) -> usize {
        self.shards.iter().map(|s| s.capacity).sum()
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &CacheKey) -> Option<Arc<CachedEntry>> {
        self.shard(key).get(key)
    }

    fn set(&self, entry: CachedEntry) {
        self.shard(&entry.key).set(entry);
    }

    fn len(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn stats(&self) -> CacheStats {
        let mut total = CacheStats::default();
        for shard in self.shards.iter() {
            total.hits += shard.hits.load(Ordering::Relaxed);
            total.misses += shard.misses.load(Ordering::Relaxed);
            total.evictions += shard.evictions.load(Ordering::Relaxed);
            total.current_size += shard.len();
            total.capacity += shard.capacity;
        }
        total
    }
}
