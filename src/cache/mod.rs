//! Three-tier query cache: hot and warm in-memory LRUs plus a persistent
//! cold tier.
//!
//! | Tier | Backing | Capacity | TTL | Recency on get |
//! |------|---------|----------|-----|----------------|
//! | Hot  | LRU map | 100      | 60 s | refreshed |
//! | Warm | LRU map | 1000     | 5 min | not refreshed |
//! | Cold | SQLite  | unbounded | 1 h | n/a |
//!
//! Promotion: a warm hit with more than 3 accesses moves to hot; a cold
//! hit with more than 5 accesses moves to warm. Evictions cascade one
//! tier down with a refreshed TTL window; entries whose absolute age
//! already exceeds the receiving tier's TTL are discarded instead.
//!
//! Invalidation is **coarse**: any graph mutation calls
//! [`MultiLevelCache::clear`], dropping all three tiers. A selective
//! `find_affected_queries` strategy was considered and rejected as
//! fragile; with coarse clearing a concurrent cache write is harmless
//! because it simply re-populates.
//!
//! Cache keys are the first 16 hex chars of `sha256` over the canonical
//! JSON form of the query descriptor; object keys are sorted during
//! serialization, so logically equivalent descriptors collide.

pub mod cold;

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::config::CacheConfig;

pub use cold::{ColdCache, ColdEntry};

/// Accesses after which a warm entry is promoted to hot.
const WARM_PROMOTE_HITS: u32 = 3;
/// Accesses after which a cold entry is promoted to warm.
const COLD_PROMOTE_HITS: u32 = 5;
/// Hex chars kept from the descriptor hash.
const KEY_LEN: usize = 16;

/// Derives the cache key for a query descriptor.
///
/// The descriptor is serialized through `serde_json::Value`, whose object
/// representation sorts keys, so permuting filter fields yields the same
/// key.
pub fn query_key<T: Serialize>(descriptor: &T) -> String {
    let canonical = serde_json::to_value(descriptor)
        .map(|v| v.to_string())
        .unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    let mut key = hex::encode(digest);
    key.truncate(KEY_LEN);
    key
}

/// Aggregate cache statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CacheStats {
    /// Entries in the hot tier.
    pub l1_entries: usize,
    /// Entries in the warm tier.
    pub l2_entries: usize,
    /// Entries in the cold tier.
    pub l3_entries: usize,
    /// Total hits across tiers.
    pub hits: u64,
    /// Total misses.
    pub misses: u64,
    /// `hits / (hits + misses)`, 0.0 when idle.
    pub hit_rate: f64,
    /// Approximate in-memory footprint of the hot and warm tiers.
    pub memory_usage_mb: f64,
}

#[derive(Clone, Debug)]
struct CachedValue {
    value: Value,
    created: Instant,
    hits: u32,
    size: usize,
}

impl CachedValue {
    fn new(value: Value) -> Self {
        let size = estimate_size(&value);
        Self {
            value,
            created: Instant::now(),
            hits: 0,
            size,
        }
    }

    fn age(&self) -> Duration {
        self.created.elapsed()
    }
}

/// Three-tier query cache.
///
/// All methods are infallible from the caller's perspective: cold-tier
/// storage failures degrade to misses and dropped writes.
pub struct MultiLevelCache {
    hot: Mutex<LruCache<String, CachedValue>>,
    warm: Mutex<LruCache<String, CachedValue>>,
    cold: Option<ColdCache>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for MultiLevelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("MultiLevelCache")
            .field("l1", &stats.l1_entries)
            .field("l2", &stats.l2_entries)
            .field("l3", &stats.l3_entries)
            .field("hit_rate", &stats.hit_rate)
            .finish()
    }
}

impl MultiLevelCache {
    /// Creates the cache. Pass `None` for `cold` to run with the two
    /// in-memory tiers only (tests, ephemeral sessions).
    pub fn new(config: CacheConfig, cold: Option<ColdCache>) -> Self {
        let hot_cap = NonZeroUsize::new(config.hot_capacity.max(1)).expect("validated nonzero");
        let warm_cap =
            NonZeroUsize::new(config.warm_capacity.max(1)).expect("validated nonzero");
        Self {
            hot: Mutex::new(LruCache::new(hot_cap)),
            warm: Mutex::new(LruCache::new(warm_cap)),
            cold,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Looks a key up across the three tiers, applying promotion rules.
    pub fn get(&self, key: &str) -> Option<Value> {
        enum Lookup {
            Hit(Value),
            Expired,
            Promote,
            Miss,
        }

        // Hot: get() refreshes LRU recency.
        {
            let mut hot = self.hot.lock();
            let lookup = match hot.get_mut(key) {
                Some(entry) if entry.age() <= self.config.hot_ttl => {
                    entry.hits += 1;
                    Lookup::Hit(entry.value.clone())
                }
                Some(_) => Lookup::Expired,
                None => Lookup::Miss,
            };
            match lookup {
                Lookup::Hit(value) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(value);
                }
                Lookup::Expired => {
                    hot.pop(key);
                }
                _ => {}
            }
        }

        // Warm: peek_mut() leaves recency untouched.
        let warm_hit = {
            let mut warm = self.warm.lock();
            let lookup = match warm.peek_mut(key) {
                Some(entry) if entry.age() <= self.config.warm_ttl => {
                    entry.hits += 1;
                    if entry.hits > WARM_PROMOTE_HITS {
                        Lookup::Promote
                    } else {
                        Lookup::Hit(entry.value.clone())
                    }
                }
                Some(_) => Lookup::Expired,
                None => Lookup::Miss,
            };
            match lookup {
                Lookup::Promote => {
                    let entry = warm.pop(key).expect("peeked entry present");
                    Some((entry.value.clone(), Some(entry)))
                }
                Lookup::Hit(value) => Some((value, None)),
                Lookup::Expired => {
                    warm.pop(key);
                    None
                }
                Lookup::Miss => None,
            }
        };
        if let Some((value, promoted)) = warm_hit {
            if let Some(entry) = promoted {
                debug!(key, "Promoting warm entry to hot");
                self.insert_hot(key.to_string(), entry);
            }
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        // Cold: persistent tier, hit counter lives in the row.
        if let Some(cold) = &self.cold {
            if let Some(entry) = cold.get(key) {
                if entry.hits > COLD_PROMOTE_HITS {
                    debug!(key, "Promoting cold entry to warm");
                    cold.remove(key);
                    self.insert_warm(key.to_string(), CachedValue::new(entry.value.clone()));
                }
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Writes a value into the hot tier; evictions cascade downward.
    pub fn put(&self, key: impl Into<String>, value: Value) {
        self.insert_hot(key.into(), CachedValue::new(value));
    }

    /// Drops every entry in every tier.
    ///
    /// This is the coarse invalidation hook called on any graph mutation.
    #[instrument(skip(self))]
    pub fn clear(&self) {
        self.hot.lock().clear();
        self.warm.lock().clear();
        if let Some(cold) = &self.cold {
            cold.clear();
        }
    }

    /// Returns aggregate statistics.
    pub fn stats(&self) -> CacheStats {
        let hot = self.hot.lock();
        let warm = self.warm.lock();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let memory_bytes: usize = hot.iter().map(|(_, v)| v.size).sum::<usize>()
            + warm.iter().map(|(_, v)| v.size).sum::<usize>();
        CacheStats {
            l1_entries: hot.len(),
            l2_entries: warm.len(),
            l3_entries: self.cold.as_ref().map(|c| c.len()).unwrap_or(0),
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            memory_usage_mb: memory_bytes as f64 / (1024.0 * 1024.0),
        }
    }

    fn insert_hot(&self, key: String, mut entry: CachedValue) {
        entry.created = Instant::now();
        let evicted = {
            let mut hot = self.hot.lock();
            hot.push(key, entry)
        };
        if let Some((evicted_key, evicted_entry)) = evicted {
            // push() returns the displaced LRU entry (or the old value for
            // the same key, which needs no demotion).
            if self.hot.lock().contains(&evicted_key) {
                return;
            }
            self.demote_to_warm(evicted_key, evicted_entry);
        }
    }

    fn demote_to_warm(&self, key: String, mut entry: CachedValue) {
        if entry.age() > self.config.warm_ttl {
            return; // too old for the receiving tier
        }
        entry.created = Instant::now(); // refreshed TTL window
        entry.hits = 0;
        self.insert_warm(key, entry);
    }

    fn insert_warm(&self, key: String, entry: CachedValue) {
        let evicted = {
            let mut warm = self.warm.lock();
            warm.push(key, entry)
        };
        if let Some((evicted_key, evicted_entry)) = evicted {
            if self.warm.lock().contains(&evicted_key) {
                return;
            }
            self.demote_to_cold(evicted_key, evicted_entry);
        }
    }

    fn demote_to_cold(&self, key: String, entry: CachedValue) {
        let Some(cold) = &self.cold else { return };
        if entry.age() > self.config.cold_ttl {
            return;
        }
        cold.put(&key, &entry.value);
    }
}

fn estimate_size(value: &Value) -> usize {
    // Serialized length is a good-enough proxy for memory accounting.
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}
