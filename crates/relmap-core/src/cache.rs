//! Cache provider contract and an in-memory reference implementation.
//!
//! Metadata and compiled queries are cached through [`CacheProvider`].
//! A cache only ever affects performance: every consumer recomputes on a
//! miss and treats undecodable entries as misses.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, PoisonError};

/// Key/value cache with string keys and opaque byte values.
pub trait CacheProvider: Send + Sync {
    /// Fetch a cached value.
    fn fetch(&self, key: &str) -> Option<Vec<u8>>;

    /// Store a value, replacing any previous entry.
    fn save(&self, key: &str, value: Vec<u8>);

    /// Check whether a key is present.
    fn contains(&self, key: &str) -> bool {
        self.fetch(key).is_some()
    }

    /// Remove a key. Returns whether it was present.
    fn delete(&self, key: &str) -> bool;

    /// Namespace prepended to every key, empty when unscoped.
    fn namespace(&self) -> &str {
        ""
    }
}

/// Fetch and decode a JSON-encoded entry. Decoding failures count as misses.
pub fn fetch_json<T: DeserializeOwned>(cache: &dyn CacheProvider, key: &str) -> Option<T> {
    let bytes = cache.fetch(key)?;
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(key = %key, error = %e, "Discarding undecodable cache entry");
            None
        }
    }
}

/// Encode a value as JSON and store it. Encoding failures skip the write.
pub fn save_json<T: Serialize>(cache: &dyn CacheProvider, key: &str, value: &T) {
    match serde_json::to_vec(value) {
        Ok(bytes) => cache.save(key, bytes),
        Err(e) => tracing::debug!(key = %key, error = %e, "Skipping cache write"),
    }
}

/// Compute a hash key for caching from any hashable value.
pub fn cache_key(value: &impl Hash) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug)]
struct CachedEntry {
    value: Vec<u8>,
    last_used: u64,
}

#[derive(Debug, Default)]
struct ArrayCacheState {
    entries: HashMap<String, CachedEntry>,
    tick: u64,
    hits: u64,
    misses: u64,
}

/// LRU-style in-memory cache.
///
/// When the cache exceeds `max_size`, the least-recently-used entry is evicted.
#[derive(Debug)]
pub struct ArrayCache {
    state: Mutex<ArrayCacheState>,
    max_size: usize,
}

/// Hit/miss counters of an [`ArrayCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl ArrayCache {
    /// Create a new cache with the given maximum number of entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            state: Mutex::new(ArrayCacheState::default()),
            max_size: max_size.max(1),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            entries: state.entries.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.stats().entries
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all cached entries.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.entries.clear();
    }
}

impl ArrayCacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Evict the least-recently-used entry.
    fn evict_lru(&mut self) {
        let lru_key = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());
        if let Some(key) = lru_key {
            tracing::trace!(key = %key, "Evicting cache entry");
            self.entries.remove(&key);
        }
    }
}

impl Default for ArrayCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl CacheProvider for ArrayCache {
    fn fetch(&self, key: &str) -> Option<Vec<u8>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let tick = state.next_tick();
        let found = state.entries.get_mut(key).map(|entry| {
            entry.last_used = tick;
            entry.value.clone()
        });
        if found.is_some() {
            state.hits += 1;
        } else {
            state.misses += 1;
        }
        found
    }

    fn save(&self, key: &str, value: Vec<u8>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.entries.contains_key(key) && state.entries.len() >= self.max_size {
            state.evict_lru();
        }
        let tick = state.next_tick();
        state.entries.insert(
            key.to_string(),
            CachedEntry {
                value,
                last_used: tick,
            },
        );
    }

    fn contains(&self, key: &str) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.entries.contains_key(key)
    }

    fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.entries.remove(key).is_some()
    }
}

/// Scopes every key of an inner cache under `namespace` + `:`.
#[derive(Debug)]
pub struct NamespacedCache<C> {
    inner: C,
    namespace: String,
}

impl<C: CacheProvider> NamespacedCache<C> {
    pub fn new(inner: C, namespace: impl Into<String>) -> Self {
        Self {
            inner,
            namespace: namespace.into(),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

impl<C: CacheProvider> CacheProvider for NamespacedCache<C> {
    fn fetch(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.fetch(&self.scoped(key))
    }

    fn save(&self, key: &str, value: Vec<u8>) {
        self.inner.save(&self.scoped(key), value);
    }

    fn contains(&self, key: &str) -> bool {
        self.inner.contains(&self.scoped(key))
    }

    fn delete(&self, key: &str) -> bool {
        self.inner.delete(&self.scoped(key))
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_hit_and_miss() {
        let cache = ArrayCache::new(10);
        assert!(cache.fetch("q1").is_none());
        cache.save("q1", b"SELECT 1".to_vec());
        assert_eq!(cache.fetch("q1").as_deref(), Some(&b"SELECT 1"[..]));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ArrayCache::new(2);
        cache.save("a", vec![1]);
        cache.save("b", vec![2]);
        // Touch "a" so "b" becomes least recently used
        assert!(cache.fetch("a").is_some());
        cache.save("c", vec![3]);

        assert_eq!(cache.len(), 2);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn test_namespace_prefix() {
        let cache = NamespacedCache::new(ArrayCache::new(10), "meta");
        cache.save("User", vec![1]);
        assert_eq!(cache.namespace(), "meta");
        assert!(cache.contains("User"));
        assert!(cache.inner().contains("meta:User"));
        assert!(!cache.inner().contains("User"));
        assert!(cache.delete("User"));
        assert!(!cache.contains("User"));
    }

    #[test]
    fn test_json_helpers() {
        let cache = ArrayCache::default();
        save_json(&cache, "k", &vec![1u32, 2, 3]);
        let back: Option<Vec<u32>> = fetch_json(&cache, "k");
        assert_eq!(back, Some(vec![1, 2, 3]));

        cache.save("bad", b"not json".to_vec());
        let bad: Option<Vec<u32>> = fetch_json(&cache, "bad");
        assert!(bad.is_none());
    }

    #[test]
    fn test_cache_key_function() {
        let key1 = cache_key(&"SELECT u FROM User u");
        let key2 = cache_key(&"SELECT u FROM User u");
        let key3 = cache_key(&"SELECT o FROM Order o");
        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
    }
}
