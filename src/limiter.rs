//! Per-tenant rate limiting over the rolling window
//!
//! `check` is a point-in-time decision: it does not reserve capacity, so two
//! concurrent checks can each allow a request that together slightly exceed
//! the quota. That drift is bounded and accepted; `record` plus subsequent
//! checks correct it. `check` never fails — anything that goes wrong on the
//! decision path degrades to a deny with a diagnostic reason.
//!
//! A small bounded decision cache (keyed by tenant key + coarse time bucket,
//! sub-second TTL) absorbs identical checks arriving in bursts. It is
//! invalidated per key by `record` and by any admin mutation of the tenant.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::tenant::TenantRecord;

/// Decision cache TTL. Kept below one second so a cached allow can never
/// outlive the usage-flush interval.
const DECISION_TTL: Duration = Duration::from_millis(500);

/// Coarse time bucket used in decision-cache keys, in millis.
const DECISION_BUCKET_MS: i64 = 500;

/// Bound on cached decisions before the sweep runs.
const DECISION_CACHE_CAP: usize = 4096;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Why a request was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// The key's expiry date has passed.
    KeyExpired,
    /// The rolling window has no room for the hinted tokens.
    LimitExceeded {
        tokens_used: u64,
        tokens_limit: u64,
        /// When the oldest live bucket falls out of the window.
        window_ends_at: i64,
        retry_after_seconds: u64,
    },
    /// Decision-path failure upgraded to a deny.
    Internal(String),
}

/// Rate limiter. Stateless apart from the decision cache; the rolling-window
/// state lives on the tenant record and is mutated under the store's per-key
/// lock.
pub struct RateLimiter {
    decisions: Mutex<HashMap<(String, i64), CachedDecision>>,
}

struct CachedDecision {
    decision: Decision,
    cached_at: Instant,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            decisions: Mutex::new(HashMap::new()),
        }
    }

    /// Decide whether a request hinting `tokens_hint` tokens may proceed.
    ///
    /// Runs window expiry as a side effect (via `total`), so the tenant's
    /// running total is settled after every check.
    pub fn check(&self, tenant: &mut TenantRecord, tokens_hint: u64, now_millis: i64) -> Decision {
        let cache_key = (tenant.key.clone(), now_millis.div_euclid(DECISION_BUCKET_MS));
        if let Some(hit) = self.cached(&cache_key) {
            return hit;
        }

        let decision = self.decide(tenant, tokens_hint, now_millis);
        self.store_decision(cache_key, decision.clone());
        decision
    }

    fn decide(&self, tenant: &mut TenantRecord, tokens_hint: u64, now_millis: i64) -> Decision {
        if tenant.is_expired(now_millis) {
            return Decision::Deny(DenyReason::KeyExpired);
        }
        // The store enforces a positive quota; a zero here means corrupted
        // state, and corrupted state fails closed.
        if tenant.token_limit_per_5h == 0 {
            return Decision::Deny(DenyReason::Internal(
                "tenant has no quota configured".to_string(),
            ));
        }

        tenant.rolling_window.expire(now_millis);
        let used = tenant.rolling_window.running_total();
        let limit = tenant.token_limit_per_5h;
        if used + tokens_hint > limit {
            let window_ends_at = tenant.rolling_window.window_ends_at(now_millis);
            let retry_ms = (window_ends_at - now_millis).max(0);
            // Ceiling division so "retry after 0.4s" reads as 1, not 0.
            let retry_after_seconds = (retry_ms as u64).div_ceil(1000);
            return Decision::Deny(DenyReason::LimitExceeded {
                tokens_used: used,
                tokens_limit: limit,
                window_ends_at,
                retry_after_seconds,
            });
        }

        Decision::Allow
    }

    /// Charge `tokens` against the tenant at `now_millis`: rolling window,
    /// lifetime counter, last-used stamp. Invalidates any cached decision
    /// for this key.
    ///
    /// Called under the store's per-key lock; concurrent records for the
    /// same key merge in the window in the order accepted.
    pub fn record(&self, tenant: &mut TenantRecord, tokens: u64, now_millis: i64) {
        if tokens == 0 {
            return;
        }
        tenant.rolling_window.add(now_millis, tokens);
        tenant.lifetime_tokens += tokens;
        tenant.last_used = now_millis;
        self.invalidate(&tenant.key);
    }

    /// Drop cached decisions for one key. Also called when the admin surface
    /// mutates the tenant, so a raised quota takes effect immediately.
    pub fn invalidate(&self, key: &str) {
        if let Ok(mut decisions) = self.decisions.lock() {
            decisions.retain(|(k, _), _| k != key);
        }
    }

    fn cached(&self, cache_key: &(String, i64)) -> Option<Decision> {
        let decisions = self.decisions.lock().ok()?;
        let hit = decisions.get(cache_key)?;
        if hit.cached_at.elapsed() < DECISION_TTL {
            Some(hit.decision.clone())
        } else {
            None
        }
    }

    fn store_decision(&self, cache_key: (String, i64), decision: Decision) {
        let Ok(mut decisions) = self.decisions.lock() else {
            return; // Poisoned mutex - skip caching
        };
        decisions.insert(
            cache_key,
            CachedDecision {
                decision,
                cached_at: Instant::now(),
            },
        );
        // Sweep expired entries once the map grows past its bound.
        if decisions.len() > DECISION_CACHE_CAP {
            decisions.retain(|_, v| v.cached_at.elapsed() < DECISION_TTL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::RollingWindow;

    const T0: i64 = 1_700_000_100_000;

    fn tenant(limit: u64) -> TenantRecord {
        TenantRecord {
            key: "tg-limiter".into(),
            name: "limiter".into(),
            model: "glm-4.7".into(),
            token_limit_per_5h: limit,
            created_at: T0,
            last_used: T0,
            expiry_date: T0 + 86_400_000,
            lifetime_tokens: 0,
            rolling_window: RollingWindow::new(18_000_000, 300_000),
        }
    }

    #[test]
    fn test_allow_under_limit() {
        let limiter = RateLimiter::new();
        let mut t = tenant(1000);
        assert_eq!(limiter.check(&mut t, 1, T0), Decision::Allow);
    }

    #[test]
    fn test_deny_expired_key() {
        let limiter = RateLimiter::new();
        let mut t = tenant(1000);
        t.expiry_date = T0 - 1;
        assert_eq!(
            limiter.check(&mut t, 1, T0),
            Decision::Deny(DenyReason::KeyExpired)
        );
    }

    #[test]
    fn test_deny_over_limit_with_retry_hint() {
        let limiter = RateLimiter::new();
        let mut t = tenant(1000);
        limiter.record(&mut t, 950, T0);

        let now = T0 + 60_000;
        match limiter.check(&mut t, 100, now) {
            Decision::Deny(DenyReason::LimitExceeded {
                tokens_used,
                tokens_limit,
                window_ends_at,
                retry_after_seconds,
            }) => {
                assert_eq!(tokens_used, 950);
                assert_eq!(tokens_limit, 1000);
                // Oldest (only) bucket starts at T0, so the window frees up
                // at T0 + W.
                assert_eq!(window_ends_at, T0 + 18_000_000);
                let expected = ((window_ends_at - now) as u64).div_ceil(1000);
                assert_eq!(retry_after_seconds, expected);
            }
            other => panic!("expected LimitExceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_exact_fit_is_allowed() {
        let limiter = RateLimiter::new();
        let mut t = tenant(1000);
        limiter.record(&mut t, 900, T0);
        // used + hint == limit is still inside the quota.
        assert!(limiter.check(&mut t, 100, T0 + 1).is_allow());
    }

    #[test]
    fn test_record_updates_counters() {
        let limiter = RateLimiter::new();
        let mut t = tenant(1000);
        limiter.record(&mut t, 30, T0);
        limiter.record(&mut t, 12, T0 + 5_000);
        assert_eq!(t.lifetime_tokens, 42);
        assert_eq!(t.last_used, T0 + 5_000);
        assert_eq!(t.rolling_window.total(T0 + 5_000), 42);
    }

    #[test]
    fn test_record_invalidates_cached_decision() {
        let limiter = RateLimiter::new();
        let mut t = tenant(100);
        // Prime the cache with an allow at this time bucket.
        assert!(limiter.check(&mut t, 1, T0).is_allow());
        // Burn the whole quota, then re-check in the same time bucket: the
        // cached allow must not survive the record.
        limiter.record(&mut t, 100, T0);
        match limiter.check(&mut t, 1, T0) {
            Decision::Deny(DenyReason::LimitExceeded { tokens_used, .. }) => {
                assert_eq!(tokens_used, 100)
            }
            other => panic!("expected LimitExceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_record_is_noop() {
        let limiter = RateLimiter::new();
        let mut t = tenant(100);
        limiter.record(&mut t, 0, T0);
        assert_eq!(t.lifetime_tokens, 0);
        assert_eq!(t.last_used, T0);
    }

    #[test]
    fn test_zero_limit_fails_closed() {
        let limiter = RateLimiter::new();
        let mut t = tenant(1000);
        t.token_limit_per_5h = 0;
        assert!(matches!(
            limiter.check(&mut t, 1, T0),
            Decision::Deny(DenyReason::Internal(_))
        ));
    }

    #[test]
    fn test_limit_smaller_than_hint_denies_on_empty_window() {
        let limiter = RateLimiter::new();
        let mut t = tenant(5);
        match limiter.check(&mut t, 10, T0) {
            Decision::Deny(DenyReason::LimitExceeded {
                tokens_used,
                window_ends_at,
                retry_after_seconds,
                ..
            }) => {
                assert_eq!(tokens_used, 0);
                // Empty window: nothing will free up; retry hint is zero.
                assert_eq!(window_ends_at, T0);
                assert_eq!(retry_after_seconds, 0);
            }
            other => panic!("expected LimitExceeded, got {:?}", other),
        }
    }
}
