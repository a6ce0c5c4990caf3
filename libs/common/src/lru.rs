//! Bounded key/value cache with recency-based eviction.

use std::hash::Hash;
use std::num::NonZeroUsize;

/// A key/value cache ordered by recency of use.
///
/// A bound of 0 means unbounded. On a bounded cache, inserting beyond the
/// bound evicts the least-recently used entry first. `get` and `set` both
/// mark the entry as most-recently used; `remove` does not affect the
/// ordering of the remaining entries.
pub struct LruCache<K: Hash + Eq, V> {
    inner: lru::LruCache<K, V>,
}

impl<K: Hash + Eq, V> LruCache<K, V> {
    pub fn new(bound: usize) -> Self {
        let inner = match NonZeroUsize::new(bound) {
            Some(bound) => lru::LruCache::new(bound),
            None => lru::LruCache::unbounded(),
        };
        Self { inner }
    }

    /// Insert or update an entry, marking it most-recently used.
    pub fn set(&mut self, key: K, value: V) {
        self.inner.put(key, value);
    }

    /// Look up an entry, marking it most-recently used if present.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    /// Look up an entry without changing its recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.inner.peek(key)
    }

    /// Remove an entry, returning its value if it existed.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.pop(key)
    }

    /// Remove and return the least-recently used entry.
    pub fn remove_oldest(&mut self) -> Option<(K, V)> {
        self.inner.pop_lru()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
