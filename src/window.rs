//! Rolling token-usage window
//!
//! Each tenant carries one of these: a sparse set of time-aligned buckets
//! plus a maintained running sum, so "tokens used in the last 5 hours" is an
//! O(1) read. Expiry of old buckets is amortized onto reads (`total`), never
//! onto `add`, so bursts of accounting writes stay cheap and a read settles
//! the window.
//!
//! Buckets are keyed by their own start timestamp, not by `index mod K`.
//! A circular-array layout lets two live buckets collide on the same slot
//! when older buckets have not been expired yet; keying by start millis
//! removes that entire class of bug.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default window length: 5 hours.
pub const DEFAULT_WINDOW_MS: i64 = 5 * 60 * 60 * 1000;

/// Default bucket size: 5 minutes.
pub const DEFAULT_BUCKET_MS: i64 = 5 * 60 * 1000;

/// Per-tenant rolling usage window.
///
/// Serializes to `{buckets, running_total, window_duration_ms, bucket_size_ms,
/// last_updated}`. On load, buckets are re-keyed from their own
/// `bucket_start_millis` fields and the running total is restored verbatim
/// (the persisted window is trusted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WindowState", into = "WindowState")]
pub struct RollingWindow {
    /// Live buckets: bucket start millis -> tokens in that bucket.
    buckets: BTreeMap<i64, u64>,
    /// Sum of all live bucket counts. Authoritative after `expire`.
    running_total: u64,
    window_ms: i64,
    bucket_ms: i64,
    /// Wall-clock millis of the most recent mutation.
    last_updated: i64,
}

impl Default for RollingWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_MS, DEFAULT_BUCKET_MS)
    }
}

impl RollingWindow {
    /// Create an empty window. `window_ms` and `bucket_ms` must be positive.
    pub fn new(window_ms: i64, bucket_ms: i64) -> Self {
        debug_assert!(window_ms > 0 && bucket_ms > 0);
        Self {
            buckets: BTreeMap::new(),
            running_total: 0,
            window_ms,
            bucket_ms,
            last_updated: 0,
        }
    }

    /// Align a timestamp down to its bucket start.
    fn bucket_start(&self, t_millis: i64) -> i64 {
        t_millis.div_euclid(self.bucket_ms) * self.bucket_ms
    }

    /// Add `tokens` to the bucket covering `t_millis`. Pure O(1); never
    /// re-runs expiry. Two adds that share a bucket start merge into one
    /// entry.
    pub fn add(&mut self, t_millis: i64, tokens: u64) {
        if tokens == 0 {
            return;
        }
        let start = self.bucket_start(t_millis);
        *self.buckets.entry(start).or_insert(0) += tokens;
        self.running_total += tokens;
        if t_millis > self.last_updated {
            self.last_updated = t_millis;
        }
    }

    /// Remove every bucket whose start is at or before `now - window`
    /// (inclusive expiry), deducting each from the running total.
    ///
    /// The saturating subtraction clamps to zero; the invariant guarantees it
    /// never actually saturates.
    pub fn expire(&mut self, now_millis: i64) {
        let cutoff = now_millis - self.window_ms;
        while let Some((&start, &tokens)) = self.buckets.first_key_value() {
            if start > cutoff {
                break;
            }
            self.buckets.remove(&start);
            self.running_total = self.running_total.saturating_sub(tokens);
        }
    }

    /// Tokens used in the window ending at `now_millis`. Runs expiry first,
    /// so the answer is consistent even when callers present a non-monotonic
    /// time sequence.
    pub fn total(&mut self, now_millis: i64) -> u64 {
        self.expire(now_millis);
        self.running_total
    }

    /// Running total without expiry. Only meaningful right after a `total`
    /// or `expire` call at a nearby timestamp.
    pub fn running_total(&self) -> u64 {
        self.running_total
    }

    /// Start of the oldest live bucket, if any.
    pub fn oldest_bucket_start(&self) -> Option<i64> {
        self.buckets.first_key_value().map(|(&k, _)| k)
    }

    /// When the current window frees up: oldest live bucket start + window
    /// length. Falls back to `now` for an empty window.
    pub fn window_ends_at(&self, now_millis: i64) -> i64 {
        self.oldest_bucket_start()
            .map(|start| start + self.window_ms)
            .unwrap_or(now_millis)
    }

}

// ─────────────────────────────────────────────────────────────────────────────
// Persisted form
// ─────────────────────────────────────────────────────────────────────────────

/// One persisted bucket. Carries its own start so restore never depends on
/// array position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketState {
    pub bucket_start_millis: i64,
    pub tokens: u64,
}

/// Wire/disk representation of a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowState {
    pub buckets: Vec<BucketState>,
    pub running_total: u64,
    pub window_duration_ms: i64,
    pub bucket_size_ms: i64,
    pub last_updated: i64,
}

impl From<RollingWindow> for WindowState {
    fn from(w: RollingWindow) -> Self {
        Self {
            buckets: w
                .buckets
                .into_iter()
                .map(|(start, tokens)| BucketState {
                    bucket_start_millis: start,
                    tokens,
                })
                .collect(),
            running_total: w.running_total,
            window_duration_ms: w.window_ms,
            bucket_size_ms: w.bucket_ms,
            last_updated: w.last_updated,
        }
    }
}

impl From<WindowState> for RollingWindow {
    fn from(s: WindowState) -> Self {
        let mut buckets = BTreeMap::new();
        for b in s.buckets {
            // Re-key by the bucket's own start; duplicate starts merge.
            *buckets.entry(b.bucket_start_millis).or_insert(0) += b.tokens;
        }
        Self {
            buckets,
            running_total: s.running_total,
            window_ms: if s.window_duration_ms > 0 {
                s.window_duration_ms
            } else {
                DEFAULT_WINDOW_MS
            },
            bucket_ms: if s.bucket_size_ms > 0 {
                s.bucket_size_ms
            } else {
                DEFAULT_BUCKET_MS
            },
            last_updated: s.last_updated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Bucket-aligned base time (a multiple of 300_000).
    const T0: i64 = 1_700_000_100_000;

    #[test]
    fn test_add_and_total_within_window() {
        let mut w = RollingWindow::new(18_000_000, 300_000);
        w.add(T0, 100);
        w.add(T0 + 120_000, 50);
        assert_eq!(w.total(T0 + 120_000), 150);
    }

    #[test]
    fn test_same_bucket_adds_merge() {
        let mut w = RollingWindow::new(18_000_000, 300_000);
        w.add(T0, 100);
        w.add(T0 + 120_000, 50);
        // Both fall inside [T0, T0 + 300_000): one live bucket.
        assert_eq!(w.oldest_bucket_start(), Some(T0));
        assert_eq!(w.buckets.len(), 1);
        assert_eq!(w.buckets[&T0], 150);
    }

    #[test]
    fn test_old_buckets_expire() {
        let mut w = RollingWindow::new(18_000_000, 300_000);
        w.add(T0, 100);
        w.add(T0 + 120_000, 50);
        w.add(T0 + 17_999_000, 25);
        // One millisecond past the first bucket's eviction point: the first
        // bucket (holding both early adds) is gone, the late add survives.
        assert_eq!(w.total(T0 + 18_000_001), 25);
    }

    #[test]
    fn test_expiry_is_inclusive_at_boundary() {
        let mut w = RollingWindow::new(18_000_000, 300_000);
        w.add(T0, 40);
        // bucket_start == now - W exactly: the bucket must be removed.
        assert_eq!(w.total(T0 + 18_000_000), 0);
        assert!(w.oldest_bucket_start().is_none());
    }

    #[test]
    fn test_one_millisecond_before_boundary_survives() {
        let mut w = RollingWindow::new(18_000_000, 300_000);
        w.add(T0, 40);
        assert_eq!(w.total(T0 + 17_999_999), 40);
    }

    #[test]
    fn test_total_matches_live_bucket_sum() {
        // P1: after total(now), running_total equals the sum over live buckets.
        let mut w = RollingWindow::new(18_000_000, 300_000);
        for i in 0..100i64 {
            w.add(T0 + i * 200_000, (i as u64 % 7) + 1);
        }
        let now = T0 + 100 * 200_000;
        let total = w.total(now);
        let live_sum: u64 = w
            .buckets
            .iter()
            .filter(|(&start, _)| start > now - w.window_ms)
            .map(|(_, &t)| t)
            .sum();
        assert_eq!(total, live_sum);
        // And no dead bucket survived the expiry pass.
        assert!(w.buckets.keys().all(|&s| s > now - w.window_ms));
    }

    #[test]
    fn test_non_monotonic_reads() {
        let mut w = RollingWindow::new(18_000_000, 300_000);
        w.add(T0, 10);
        w.add(T0 + 17_000_000, 20);
        assert_eq!(w.total(T0 + 18_000_000), 20);
        // An earlier `now` after expiry already ran: the expired bucket stays
        // gone, the answer stays consistent with what remains.
        assert_eq!(w.total(T0 + 17_000_000), 20);
    }

    #[test]
    fn test_serde_roundtrip_preserves_totals() {
        // P2: serialize then deserialize yields the same totals at any probe time.
        let mut w = RollingWindow::new(18_000_000, 300_000);
        w.add(T0, 100);
        w.add(T0 + 600_000, 50);
        w.add(T0 + 1_200_000, 7);

        let json = serde_json::to_string(&w).unwrap();
        let mut restored: RollingWindow = serde_json::from_str(&json).unwrap();

        for probe in [T0, T0 + 1_200_000, T0 + 18_000_000, T0 + 19_000_000] {
            assert_eq!(restored.total(probe), w.clone().total(probe));
        }
    }

    #[test]
    fn test_restore_merges_duplicate_bucket_starts() {
        let state = WindowState {
            buckets: vec![
                BucketState {
                    bucket_start_millis: T0,
                    tokens: 5,
                },
                BucketState {
                    bucket_start_millis: T0,
                    tokens: 7,
                },
            ],
            running_total: 12,
            window_duration_ms: 18_000_000,
            bucket_size_ms: 300_000,
            last_updated: T0,
        };
        let mut w = RollingWindow::from(state);
        assert_eq!(w.total(T0 + 1), 12);
        assert_eq!(w.oldest_bucket_start(), Some(T0));
    }

    #[test]
    fn test_window_ends_at() {
        let mut w = RollingWindow::new(18_000_000, 300_000);
        assert_eq!(w.window_ends_at(T0), T0);
        w.add(T0, 1);
        assert_eq!(w.window_ends_at(T0 + 5), T0 + 18_000_000);
    }

    #[test]
    fn test_zero_token_add_is_ignored() {
        let mut w = RollingWindow::default();
        w.add(T0, 0);
        assert!(w.oldest_bucket_start().is_none());
        assert_eq!(w.running_total(), 0);
    }
}
