//! In-memory cache with TTL and priority eviction

use heapwatch_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub default_ttl: Duration,
    /// Serialized values above this size are stored in their compact
    /// byte form and flagged compressed.
    pub compress_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            default_ttl: Duration::from_secs(60),
            compress_threshold: 16 * 1024,
        }
    }
}

/// Per-put options.
#[derive(Debug, Clone, Copy, Default)]
pub struct PutOptions {
    pub ttl: Option<Duration>,
    pub priority: Option<u32>,
}

/// Cache counters for the query surface.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    pub entries: usize,
    pub compressed_entries: usize,
}

enum Stored {
    Plain(serde_json::Value),
    /// Compact serialized form; decompression is a deserialize.
    Compressed(Vec<u8>),
}

struct Entry {
    stored: Stored,
    priority: u32,
    access_count: u64,
    created_at: Instant,
    expires_at: Instant,
}

/// TTL + priority cache owned by the optimizer.
pub struct OptimizerCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
}

struct CacheState {
    entries: HashMap<String, Entry>,
    stats: CacheStats,
}

impl OptimizerCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                stats: CacheStats::default(),
            }),
        }
    }

    /// Fetch a value; `None` on miss or TTL expiry.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut state = self.state.lock();
        let expired = state
            .entries
            .get(key)
            .is_some_and(|e| Instant::now() >= e.expires_at);
        if expired {
            state.entries.remove(key);
            state.stats.expired += 1;
            state.stats.misses += 1;
            return None;
        }
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.access_count += 1;
                let value = match &entry.stored {
                    Stored::Plain(v) => Some(v.clone()),
                    Stored::Compressed(bytes) => serde_json::from_slice(bytes).ok(),
                };
                state.stats.hits += 1;
                value
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    /// Insert a value, evicting the bottom quarter when full.
    pub fn put(&self, key: impl Into<String>, value: serde_json::Value, options: PutOptions) -> Result<()> {
        let key = key.into();
        let ttl = options.ttl.unwrap_or(self.config.default_ttl);
        let priority = options.priority.unwrap_or(1);

        let bytes = serde_json::to_vec(&value)?;
        let stored = if bytes.len() > self.config.compress_threshold {
            Stored::Compressed(bytes)
        } else {
            Stored::Plain(value)
        };

        let now = Instant::now();
        let mut state = self.state.lock();
        if !state.entries.contains_key(&key) && state.entries.len() >= self.config.max_entries {
            self.evict_bottom_quarter(&mut state);
        }
        state.entries.insert(
            key,
            Entry {
                stored,
                priority,
                access_count: 0,
                created_at: now,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    /// Evict the bottom 25% ordered by (priority asc, access count asc,
    /// age desc).
    fn evict_bottom_quarter(&self, state: &mut CacheState) {
        let mut ranked: Vec<(String, u32, u64, Instant)> = state
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.priority, e.access_count, e.created_at))
            .collect();
        // Oldest first within equal priority and access count.
        ranked.sort_by(|a, b| {
            a.1.cmp(&b.1)
                .then(a.2.cmp(&b.2))
                .then(a.3.cmp(&b.3))
        });
        let victims = (ranked.len() / 4).max(1);
        for (key, ..) in ranked.into_iter().take(victims) {
            state.entries.remove(&key);
            state.stats.evictions += 1;
        }
        debug!(evicted = victims, "cache eviction pass");
    }

    /// Drop every expired entry; scheduled by the cache janitor.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|_, e| now < e.expires_at);
        let purged = before - state.entries.len();
        state.stats.expired += purged as u64;
        purged
    }

    pub fn remove(&self, key: &str) -> bool {
        self.state.lock().entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            compressed_entries: state
                .entries
                .values()
                .filter(|e| matches!(e.stored, Stored::Compressed(_)))
                .count(),
            ..state.stats
        }
    }

    /// Validation helper: confirm a key round-trips through its stored
    /// representation.
    pub fn verify_roundtrip(&self, key: &str) -> Result<()> {
        self.get(key)
            .map(|_| ())
            .ok_or_else(|| Error::Performance(format!("cache entry '{}' failed round-trip", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_entries: usize, ttl_ms: u64) -> OptimizerCache {
        OptimizerCache::new(CacheConfig {
            max_entries,
            default_ttl: Duration::from_millis(ttl_ms),
            compress_threshold: 64,
        })
    }

    #[test]
    fn get_put_roundtrip() {
        let cache = cache(16, 10_000);
        cache
            .put("k", serde_json::json!({"answer": 42}), PutOptions::default())
            .unwrap();
        assert_eq!(cache.get("k").unwrap()["answer"], 42);
        assert_eq!(cache.stats().hits, 1);
        assert!(cache.get("absent").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn ttl_expiry_counts_as_miss() {
        let cache = cache(16, 1);
        cache
            .put("k", serde_json::json!(1), PutOptions::default())
            .unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.get("k").is_none());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expired, 1);
    }

    #[test]
    fn large_values_are_marked_compressed_and_roundtrip() {
        let cache = cache(16, 10_000);
        let big = serde_json::json!({ "payload": "x".repeat(500) });
        cache.put("big", big.clone(), PutOptions::default()).unwrap();
        assert_eq!(cache.stats().compressed_entries, 1);
        assert_eq!(cache.get("big").unwrap(), big);
        cache.verify_roundtrip("big").unwrap();
    }

    #[test]
    fn eviction_prefers_low_priority_then_cold_then_old() {
        let cache = cache(4, 10_000);
        cache
            .put(
                "low",
                serde_json::json!(1),
                PutOptions {
                    priority: Some(0),
                    ..Default::default()
                },
            )
            .unwrap();
        for key in ["a", "b", "c"] {
            cache
                .put(
                    key,
                    serde_json::json!(1),
                    PutOptions {
                        priority: Some(5),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        // Warm one of the high-priority entries.
        cache.get("a");

        // Fifth insert evicts the bottom quarter (one entry): the
        // low-priority one.
        cache
            .put(
                "new",
                serde_json::json!(1),
                PutOptions {
                    priority: Some(5),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(cache.get("low").is_none());
        assert!(cache.get("a").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn janitor_purges_expired_entries() {
        let cache = cache(16, 1);
        for key in ["a", "b", "c"] {
            cache.put(key, serde_json::json!(1), PutOptions::default()).unwrap();
        }
        cache
            .put(
                "fresh",
                serde_json::json!(1),
                PutOptions {
                    ttl: Some(Duration::from_secs(60)),
                    ..Default::default()
                },
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.purge_expired(), 3);
        assert_eq!(cache.stats().entries, 1);
    }
}
