//! Bounded, sharded LRU cache of decoded row snapshots.
//!
//! [`crate::table::Table`] keys this by `(table generation, rowid)` and
//! stores whatever a read decoded, so a repeated lookup of a hot row skips
//! re-decoding it from [`crate::storage::BlockStorage`]. The map is split
//! into independent shards, each behind its own lock — the same
//! `Arc<RwLock<_>>`-per-unit-of-concurrency idiom the storage and memtable
//! layers use elsewhere in this crate, just applied per shard instead of to
//! a single global structure, so a cache miss in one shard never blocks a
//! hit in another.
//!
//! Eviction is classic intrusive-doubly-linked-list LRU: a hit unlinks and
//! re-links the entry at the head; an insert past capacity evicts from the
//! tail. No background thread — eviction is synchronous with the triggering
//! insert, which keeps the structure simple and its cost easy to reason
//! about.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

const DEFAULT_SHARDS: usize = 16;

/// Tuning knobs for a [`Cache`].
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Maximum number of entries held *per shard*. Total capacity is
    /// approximately `shards * per_shard_capacity`.
    pub per_shard_capacity: usize,
    pub shards: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            per_shard_capacity: 256,
            shards: DEFAULT_SHARDS,
        }
    }
}

impl CacheConfig {
    /// Build a config targeting an approximate total entry budget, split
    /// evenly across `shards` shards.
    pub fn with_total_capacity(total: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            per_shard_capacity: (total / shards).max(1),
            shards,
        }
    }
}

type SlotId = usize;

struct Slot<K, V> {
    key: K,
    value: V,
    prev: Option<SlotId>,
    next: Option<SlotId>,
}

struct Shard<K, V> {
    map: HashMap<K, SlotId>,
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<SlotId>,
    head: Option<SlotId>,
    tail: Option<SlotId>,
    capacity: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<K: Clone + Eq + Hash, V> Shard<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            capacity: capacity.max(1),
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn unlink(&mut self, id: SlotId) {
        let (prev, next) = {
            let slot = self.slots[id].as_ref().unwrap();
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slots[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, id: SlotId) {
        let old_head = self.head;
        {
            let slot = self.slots[id].as_mut().unwrap();
            slot.prev = None;
            slot.next = old_head;
        }
        if let Some(h) = old_head {
            self.slots[h].as_mut().unwrap().prev = Some(id);
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
    }

    fn touch(&mut self, id: SlotId) {
        if self.head == Some(id) {
            return;
        }
        self.unlink(id);
        self.push_front(id);
    }

    fn get(&mut self, key: &K) -> Option<&V> {
        match self.map.get(key).copied() {
            Some(id) => {
                self.touch(id);
                self.hits += 1;
                Some(&self.slots[id].as_ref().unwrap().value)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn insert(&mut self, key: K, value: V) {
        if let Some(&id) = self.map.get(&key) {
            self.slots[id].as_mut().unwrap().value = value;
            self.touch(id);
            return;
        }

        let id = if let Some(id) = self.free.pop() {
            self.slots[id] = Some(Slot { key: key.clone(), value, prev: None, next: None });
            id
        } else {
            self.slots.push(Some(Slot { key: key.clone(), value, prev: None, next: None }));
            self.slots.len() - 1
        };
        self.map.insert(key, id);
        self.push_front(id);

        while self.map.len() > self.capacity {
            let Some(victim) = self.tail else { break };
            self.unlink(victim);
            let evicted = self.slots[victim].take().unwrap();
            self.map.remove(&evicted.key);
            self.free.push(victim);
            self.evictions += 1;
        }
    }

    fn invalidate(&mut self, key: &K) -> bool {
        match self.map.remove(key) {
            Some(id) => {
                self.unlink(id);
                self.slots[id] = None;
                self.free.push(id);
                true
            }
            None => false,
        }
    }

    fn clear(&mut self) {
        self.map.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Aggregate hit/miss/eviction counters across all shards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub len: usize,
}

/// A bounded, sharded LRU cache mapping `K` to a cloneable `V` (a decoded
/// row, in [`crate::table::Table`]'s use, but generic so it can also back
/// index page caching).
pub struct Cache<K, V> {
    shards: Vec<Mutex<Shard<K, V>>>,
}

impl<K: Clone + Eq + Hash, V: Clone> Cache<K, V> {
    pub fn new(config: CacheConfig) -> Self {
        let shards = (0..config.shards.max(1)).map(|_| Mutex::new(Shard::new(config.per_shard_capacity))).collect();
        Self { shards }
    }

    fn shard_for(&self, key: &K) -> &Mutex<Shard<K, V>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.shard_for(key)
            .lock()
            .expect("cache shard lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn insert(&self, key: K, value: V) {
        self.shard_for(&key).lock().expect("cache shard lock poisoned").insert(key, value);
    }

    /// Remove `key` if present. Callers must invalidate on every write path
    /// (update or delete) so the cache never serves a stale row.
    pub fn invalidate(&self, key: &K) -> bool {
        self.shard_for(key).lock().expect("cache shard lock poisoned").invalidate(key)
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().expect("cache shard lock poisoned").clear();
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().expect("cache shard lock poisoned").len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for shard in &self.shards {
            let shard = shard.lock().expect("cache shard lock poisoned");
            stats.hits += shard.hits;
            stats.misses += shard.misses;
            stats.evictions += shard.evictions;
            stats.len += shard.len();
        }
        stats
    }
}
