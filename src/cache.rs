//! Response cache - LRU with lazy TTL expiry
//!
//! Short-TTL memoization of buffered upstream responses, keyed by a stable
//! fingerprint of (method, path, body, tenant model). Streamed responses and
//! non-2xx statuses never enter the cache; the proxy engine enforces that at
//! the call site and `set` re-checks the status.
//!
//! Eviction is strict LRU: inserting a new key at capacity removes exactly
//! the least-recently-used entry. Expiry is lazy - an entry past its TTL is
//! dropped by the lookup that finds it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use sha2::{Digest, Sha256};

/// Configuration for the response cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum number of entries before LRU eviction.
    pub max_size: usize,
    /// Default entry lifetime.
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: 512,
            default_ttl: Duration::from_secs(30),
        }
    }
}

/// One cached response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub body: Bytes,
    pub status: u16,
    /// (name, value) pairs worth replaying; the engine filters hop-by-hop
    /// headers before storing.
    pub headers: Vec<(String, String)>,
    pub tokens_used: Option<u64>,
}

struct Entry {
    response: CachedResponse,
    created_at: Instant,
    ttl: Duration,
    /// Monotonic recency stamp; smallest is the LRU victim.
    last_access: u64,
    access_count: u64,
}

#[derive(Debug, Default)]
struct CacheStats {
    lookups: u64,
    hits: u64,
    misses: u64,
    evicted: u64,
    expired: u64,
    lookup_nanos_total: u64,
}

/// Point-in-time metrics for the stats surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheMetricsSnapshot {
    pub size: usize,
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_pct: f64,
    pub evicted: u64,
    pub expired: u64,
    pub avg_lookup_us: u64,
}

struct CacheInner {
    entries: HashMap<String, Entry>,
    access_seq: u64,
    stats: CacheStats,
}

/// LRU + TTL response cache. Safe for concurrent callers.
pub struct ResponseCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                access_seq: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Stable fingerprint for a request. The body is hashed as presented
    /// (after model injection), so the tenant's model binding is part of the
    /// key even when the path and payload match.
    pub fn fingerprint(method: &str, path: &str, body: &[u8], model: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(method.as_bytes());
        hasher.update(b"\0");
        hasher.update(path.as_bytes());
        hasher.update(b"\0");
        hasher.update(body);
        hasher.update(b"\0");
        hasher.update(model.as_bytes());
        let digest = hasher.finalize();
        digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Look up a cached response. Touches LRU order on hit; lazily expires
    /// an entry whose TTL has passed.
    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        if !self.config.enabled {
            return None;
        }
        let started = Instant::now();
        let mut inner = self.inner.lock().ok()?;
        inner.stats.lookups += 1;

        let state = inner
            .entries
            .get(key)
            .map(|entry| entry.created_at.elapsed() > entry.ttl);
        let result = match state {
            None => {
                inner.stats.misses += 1;
                None
            }
            Some(true) => {
                inner.entries.remove(key);
                inner.stats.expired += 1;
                inner.stats.misses += 1;
                None
            }
            Some(false) => {
                inner.access_seq += 1;
                let seq = inner.access_seq;
                let response = inner.entries.get_mut(key).map(|entry| {
                    entry.last_access = seq;
                    entry.access_count += 1;
                    entry.response.clone()
                });
                inner.stats.hits += 1;
                response
            }
        };

        inner.stats.lookup_nanos_total += started.elapsed().as_nanos() as u64;
        result
    }

    /// Insert a response. A write to an existing key refreshes it in place;
    /// a new key at capacity evicts the least-recently-used entry first.
    /// Non-2xx responses are refused.
    pub fn set(&self, key: String, response: CachedResponse, ttl: Option<Duration>) {
        if !self.config.enabled || self.config.max_size == 0 {
            return;
        }
        if !(200..300).contains(&response.status) {
            return;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.config.max_size {
            if let Some(victim) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&victim);
                inner.stats.evicted += 1;
            }
        }

        inner.access_seq += 1;
        let seq = inner.access_seq;
        inner.entries.insert(
            key,
            Entry {
                response,
                created_at: Instant::now(),
                ttl: ttl.unwrap_or(self.config.default_ttl),
                last_access: seq,
                access_count: 0,
            },
        );
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        let inner = self.inner.lock().expect("cache lock");
        let s = &inner.stats;
        CacheMetricsSnapshot {
            size: inner.entries.len(),
            lookups: s.lookups,
            hits: s.hits,
            misses: s.misses,
            hit_rate_pct: if s.lookups > 0 {
                (s.hits as f64 / s.lookups as f64) * 100.0
            } else {
                0.0
            },
            evicted: s.evicted,
            expired: s.expired,
            avg_lookup_us: if s.lookups > 0 {
                s.lookup_nanos_total / s.lookups / 1000
            } else {
                0
            },
        }
    }
}
