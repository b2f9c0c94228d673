//! Semantic layer: embedding/search caches and the code analyzer.

pub mod analyzer;

pub use analyzer::{
    CloneGroup, CodeAnalyzer, CodeMetrics, FragmentKind, RefactoringSuggestion, SuggestionKind,
    CLONE_SIMILARITY,
};

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;

use crate::config::SemanticCacheConfig;
use crate::vector::SearchHit;

/// Statistics for the semantic cache.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SemanticCacheStats {
    /// Entries in the embeddings map.
    pub embedding_entries: usize,
    /// Entries in the search-results map.
    pub search_entries: usize,
    /// Entries in the general map.
    pub general_entries: usize,
    /// Hits across all maps.
    pub hits: u64,
    /// Misses across all maps.
    pub misses: u64,
    /// Approximate bytes held by cached values.
    pub memory_bytes: usize,
}

struct Timed<T> {
    value: T,
    created: Instant,
    size: usize,
}

impl<T> Timed<T> {
    fn new(value: T, size: usize) -> Self {
        Self {
            value,
            created: Instant::now(),
            size,
        }
    }
}

/// Three TTL'd LRU maps: embeddings, search results, general values.
///
/// Byte-size accounting is approximate (vector length × 4, serialized
/// JSON length) and intended for observability, not enforcement.
pub struct SemanticCache {
    embeddings: Mutex<LruCache<String, Timed<Vec<f32>>>>,
    search: Mutex<LruCache<String, Timed<Vec<SearchHit>>>>,
    general: Mutex<LruCache<String, Timed<Value>>>,
    config: SemanticCacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for SemanticCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("SemanticCache")
            .field("embeddings", &stats.embedding_entries)
            .field("search", &stats.search_entries)
            .field("general", &stats.general_entries)
            .finish()
    }
}

impl SemanticCache {
    /// Creates the cache with the configured capacities.
    pub fn new(config: SemanticCacheConfig) -> Self {
        let cap = |n: usize| NonZeroUsize::new(n.max(1)).expect("nonzero");
        Self {
            embeddings: Mutex::new(LruCache::new(cap(config.embedding_capacity))),
            search: Mutex::new(LruCache::new(cap(config.search_capacity))),
            general: Mutex::new(LruCache::new(cap(config.general_capacity))),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Looks up a cached embedding vector.
    pub fn get_embedding(&self, key: &str) -> Option<Vec<f32>> {
        self.get_timed(&self.embeddings, key)
    }

    /// Caches an embedding vector.
    pub fn put_embedding(&self, key: String, vector: Vec<f32>) {
        let size = vector.len() * 4;
        self.embeddings.lock().push(key, Timed::new(vector, size));
    }

    /// Looks up cached semantic search results.
    pub fn get_search(&self, key: &str) -> Option<Vec<SearchHit>> {
        self.get_timed(&self.search, key)
    }

    /// Caches semantic search results.
    pub fn put_search(&self, key: String, hits: Vec<SearchHit>) {
        let size = hits.len() * 64;
        self.search.lock().push(key, Timed::new(hits, size));
    }

    /// Looks up a cached general value.
    pub fn get_general(&self, key: &str) -> Option<Value> {
        self.get_timed(&self.general, key)
    }

    /// Shared tiered lookup: fresh entries hit, stale entries are
    /// evicted on the way out, everything else is a miss.
    fn get_timed<T: Clone>(
        &self,
        map: &Mutex<LruCache<String, Timed<T>>>,
        key: &str,
    ) -> Option<T> {
        let mut map = map.lock();
        let (value, expired) = match map.get(key) {
            Some(entry) if entry.created.elapsed() <= self.config.ttl => {
                (Some(entry.value.clone()), false)
            }
            Some(_) => (None, true),
            None => (None, false),
        };
        if expired {
            map.pop(key);
        }
        match value {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Caches a general value.
    pub fn put_general(&self, key: String, value: Value) {
        let size = value.to_string().len();
        self.general.lock().push(key, Timed::new(value, size));
    }

    /// Pre-populates the embedding map, e.g. from a previous session.
    pub fn warmup(&self, preloaded: Vec<(String, Vec<f32>)>) {
        for (key, vector) in preloaded {
            self.put_embedding(key, vector);
        }
    }

    /// Drops every entry in every map.
    pub fn clear(&self) {
        self.embeddings.lock().clear();
        self.search.lock().clear();
        self.general.lock().clear();
    }

    /// Returns aggregate statistics.
    pub fn stats(&self) -> SemanticCacheStats {
        let embeddings = self.embeddings.lock();
        let search = self.search.lock();
        let general = self.general.lock();
        let memory_bytes = embeddings.iter().map(|(_, v)| v.size).sum::<usize>()
            + search.iter().map(|(_, v)| v.size).sum::<usize>()
            + general.iter().map(|(_, v)| v.size).sum::<usize>();
        SemanticCacheStats {
            embedding_entries: embeddings.len(),
            search_entries: search.len(),
            general_entries: general.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            memory_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cache() -> SemanticCache {
        SemanticCache::new(SemanticCacheConfig::default())
    }

    #[test]
    fn test_embedding_round_trip() {
        let cache = cache();
        cache.put_embedding("k".to_string(), vec![1.0, 2.0]);
        assert_eq!(cache.get_embedding("k"), Some(vec![1.0, 2.0]));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_miss_counts() {
        let cache = cache();
        assert!(cache.get_embedding("missing").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = SemanticCache::new(SemanticCacheConfig {
            ttl: Duration::from_millis(0),
            ..Default::default()
        });
        cache.put_embedding("k".to_string(), vec![1.0]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get_embedding("k").is_none());
        assert_eq!(cache.stats().embedding_entries, 0);
    }

    #[test]
    fn test_capacity_bound() {
        let cache = SemanticCache::new(SemanticCacheConfig {
            embedding_capacity: 2,
            ..Default::default()
        });
        cache.put_embedding("a".to_string(), vec![1.0]);
        cache.put_embedding("b".to_string(), vec![2.0]);
        cache.put_embedding("c".to_string(), vec![3.0]);
        assert_eq!(cache.stats().embedding_entries, 2);
        assert!(cache.get_embedding("a").is_none());
    }

    #[test]
    fn test_warmup_and_clear() {
        let cache = cache();
        cache.warmup(vec![
            ("x".to_string(), vec![1.0]),
            ("y".to_string(), vec![2.0]),
        ]);
        assert_eq!(cache.stats().embedding_entries, 2);
        cache.clear();
        assert_eq!(cache.stats().embedding_entries, 0);
    }

    #[test]
    fn test_memory_accounting() {
        let cache = cache();
        cache.put_embedding("k".to_string(), vec![0.0; 100]);
        assert_eq!(cache.stats().memory_bytes, 400);
    }
}
