//! Least recently used (LRU) cache
//!
//! Implements a bounded map with least-recently-used replacement. Recency is
//! tracked with a monotonic use counter per entry; eviction scans for the
//! smallest counter. Capacities used in packvault are small (blob listings,
//! open pack sections), so the linear eviction scan is not a concern.

use std::collections::HashMap;
use std::hash::Hash;

/// Interface for getting values on cache misses.
pub trait Cacher<K, V> {
    /// Fetch a value for key on cache miss.
    ///
    /// If no value can be obtained for the given key, None is returned and
    /// the cache is not updated.
    fn fetch(&mut self, key: K) -> Result<Option<V>, anyhow::Error>;
}

pub struct LruCache<K, V> {
    map: HashMap<K, (V, u64)>,
    capacity: usize,
    tick: u64,
}

impl<K: Hash + Eq + Clone, V> LruCache<K, V> {
    /// Create LRU cache instance which holds up to `capacity` nodes at once.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            map: HashMap::with_capacity(capacity),
            capacity,
            tick: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Insert or update an entry, evicting the least recently used entry if
    /// the cache is full. Returns true if a new entry was added.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        self.tick += 1;
        let tick = self.tick;
        if let Some(node) = self.map.get_mut(&key) {
            *node = (value, tick);
            return false;
        }
        if self.map.len() >= self.capacity {
            self.evict_one();
        }
        self.map.insert(key, (value, tick));
        true
    }

    /// Remove the given key from the cache, returning the stored value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key).map(|(value, _)| value)
    }

    /// Get a mutable reference to the value, marking the entry as most
    /// recently used.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.tick += 1;
        let tick = self.tick;
        self.map.get_mut(key).map(|node| {
            node.1 = tick;
            &mut node.0
        })
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Access the value for key, filling the cache via `cacher` on a miss.
    pub fn access<'a>(
        &'a mut self,
        key: K,
        cacher: &mut dyn Cacher<K, V>,
    ) -> Result<Option<&'a mut V>, anyhow::Error> {
        if !self.map.contains_key(&key) {
            match cacher.fetch(key.clone())? {
                None => return Ok(None),
                Some(value) => {
                    self.insert(key.clone(), value);
                }
            }
        }
        Ok(self.get_mut(&key))
    }

    fn evict_one(&mut self) {
        let oldest = self
            .map
            .iter()
            .min_by_key(|(_, (_, tick))| *tick)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.map.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler;

    impl Cacher<u64, u64> for Doubler {
        fn fetch(&mut self, key: u64) -> Result<Option<u64>, anyhow::Error> {
            if key == 13 {
                Ok(None)
            } else {
                Ok(Some(key * 2))
            }
        }
    }

    #[test]
    fn eviction_order() {
        let mut cache = LruCache::new(3);
        cache.insert(1, 1);
        cache.insert(2, 2);
        cache.insert(3, 3);
        // touch 1 so 2 becomes the oldest
        assert_eq!(cache.get_mut(&1), Some(&mut 1));
        cache.insert(4, 4);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get_mut(&2), None);
        assert_eq!(cache.get_mut(&1), Some(&mut 1));
        assert_eq!(cache.get_mut(&4), Some(&mut 4));
    }

    #[test]
    fn access_fetches_misses() {
        let mut cache = LruCache::new(2);
        assert_eq!(cache.access(21, &mut Doubler).unwrap(), Some(&mut 42));
        assert_eq!(cache.access(21, &mut Doubler).unwrap(), Some(&mut 42));
        assert_eq!(cache.access(13, &mut Doubler).unwrap(), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn update_does_not_grow() {
        let mut cache = LruCache::new(2);
        assert!(cache.insert(1, 1));
        assert!(!cache.insert(1, 10));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_mut(&1), Some(&mut 10));
    }
}
