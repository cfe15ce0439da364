//! Sharded LRU cache with reference-counted handles.
//!
//! Values are handed out as `Arc<V>` clones, so eviction never invalidates
//! an outstanding handle: the entry leaves the cache's books immediately
//! but the value is only dropped when the last handle goes away. Capacity
//! is expressed in caller-defined charge units (bytes for the block cache,
//! entries for the table cache).
//!
//! Keys are hashed to one of 16 shards; each shard keeps strict LRU order
//! with a recency index so eviction is O(log n).

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const NUM_SHARD_BITS: usize = 4;
const NUM_SHARDS: usize = 1 << NUM_SHARD_BITS;

pub struct Cache<K, V> {
    shards: Vec<Mutex<Shard<K, V>>>,
    next_id: AtomicU64,
}

struct Shard<K, V> {
    capacity: usize,
    usage: usize,
    counter: u64,
    map: HashMap<K, Entry<V>>,
    recency: BTreeMap<u64, K>,
}

struct Entry<V> {
    value: Arc<V>,
    charge: usize,
    stamp: u64,
}

impl<K: Hash + Eq + Clone, V> Cache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let per_shard = (capacity + NUM_SHARDS - 1) / NUM_SHARDS;
        let shards = (0..NUM_SHARDS)
            .map(|_| {
                Mutex::new(Shard {
                    capacity: per_shard,
                    usage: 0,
                    counter: 0,
                    map: HashMap::new(),
                    recency: BTreeMap::new(),
                })
            })
            .collect();
        Cache {
            shards,
            next_id: AtomicU64::new(1),
        }
    }

    fn shard(&self, key: &K) -> &Mutex<Shard<K, V>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & (NUM_SHARDS - 1)]
    }

    /// Inserts `value` under `key`, replacing any previous entry, and
    /// returns a handle to it. May evict least-recently-used entries to
    /// stay within capacity.
    pub fn insert(&self, key: K, value: V, charge: usize) -> Arc<V> {
        let handle = Arc::new(value);
        let mut shard = self.shard(&key).lock().unwrap();
        shard.remove(&key);
        shard.counter += 1;
        let stamp = shard.counter;
        shard.usage += charge;
        shard.recency.insert(stamp, key.clone());
        shard.map.insert(
            key,
            Entry {
                value: handle.clone(),
                charge,
                stamp,
            },
        );
        shard.evict();
        handle
    }

    /// Looks up `key`, bumping it to most-recently-used. Dropping the
    /// returned handle releases it.
    pub fn lookup(&self, key: &K) -> Option<Arc<V>> {
        let mut guard = self.shard(key).lock().unwrap();
        let shard = &mut *guard;
        shard.counter += 1;
        let stamp = shard.counter;
        let entry = shard.map.get_mut(key)?;
        let old_stamp = entry.stamp;
        entry.stamp = stamp;
        let value = entry.value.clone();
        shard.recency.remove(&old_stamp);
        shard.recency.insert(stamp, key.clone());
        Some(value)
    }

    /// Drops the entry for `key` if present. Outstanding handles stay
    /// valid.
    pub fn erase(&self, key: &K) {
        let mut shard = self.shard(key).lock().unwrap();
        shard.remove(key);
    }

    /// Sum of the charges of all resident entries.
    pub fn total_charge(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap().usage)
            .sum()
    }

    /// A process-unique id, used to partition a shared cache between
    /// clients (each table prefixes its block keys with one).
    pub fn new_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl<K: Hash + Eq + Clone, V> Shard<K, V> {
    fn remove(&mut self, key: &K) {
        if let Some(entry) = self.map.remove(key) {
            self.usage -= entry.charge;
            self.recency.remove(&entry.stamp);
        }
    }

    fn evict(&mut self) {
        while self.usage > self.capacity && self.map.len() > 1 {
            let (&stamp, _) = match self.recency.iter().next() {
                Some(kv) => kv,
                None => break,
            };
            let key = self.recency.remove(&stamp).unwrap();
            if let Some(entry) = self.map.remove(&key) {
                self.usage -= entry.charge;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_get(cache: &Cache<u32, u32>, key: u32, value: u32) {
        cache.insert(key, value, 1);
    }

    fn lookup(cache: &Cache<u32, u32>, key: u32) -> Option<u32> {
        cache.lookup(&key).map(|v| *v)
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = Cache::new(1000);
        assert_eq!(lookup(&cache, 100), None);

        insert_get(&cache, 100, 101);
        assert_eq!(lookup(&cache, 100), Some(101));
        assert_eq!(lookup(&cache, 200), None);

        insert_get(&cache, 100, 102);
        assert_eq!(lookup(&cache, 100), Some(102));
    }

    #[test]
    fn test_erase() {
        let cache = Cache::new(1000);
        insert_get(&cache, 100, 101);
        cache.erase(&100);
        assert_eq!(lookup(&cache, 100), None);
        // Erasing again is a no-op.
        cache.erase(&100);
    }

    #[test]
    fn test_handles_outlive_eviction() {
        let cache: Cache<u32, Vec<u8>> = Cache::new(4);
        let handle = cache.insert(1, vec![7u8; 3], 1);
        // Crowd the entry out of every shard.
        for i in 2..2000u32 {
            cache.insert(i, vec![0u8; 1], 1);
        }
        assert_eq!(handle.as_slice(), &[7u8; 3]);
    }

    #[test]
    fn test_eviction_is_lru() {
        // Single unit of capacity per shard means every insert evicts,
        // keeping only the newest entry per shard; use a larger cache and
        // uniform keys instead to observe ordering.
        let cache = Cache::new(NUM_SHARDS * 4);
        for i in 0..(NUM_SHARDS as u32 * 4) {
            insert_get(&cache, i, i);
        }
        // Touch the low keys so they become recent.
        for i in 0..8u32 {
            let _ = lookup(&cache, i);
        }
        for i in 0..(NUM_SHARDS as u32 * 8) {
            insert_get(&cache, 10_000 + i, i);
        }
        // The untouched middle keys should be mostly gone.
        let survivors = (8..NUM_SHARDS as u32 * 4)
            .filter(|&i| lookup(&cache, i).is_some())
            .count();
        assert!(survivors < 8, "survivors = {survivors}");
    }

    #[test]
    fn test_charge_accounting() {
        let cache: Cache<u32, u32> = Cache::new(1000);
        cache.insert(1, 1, 10);
        cache.insert(2, 2, 20);
        assert_eq!(cache.total_charge(), 30);
        cache.erase(&1);
        assert_eq!(cache.total_charge(), 20);
    }

    #[test]
    fn test_new_ids_are_unique() {
        let cache: Cache<u32, u32> = Cache::new(10);
        let a = cache.new_id();
        let b = cache.new_id();
        assert_ne!(a, b);
    }
}
