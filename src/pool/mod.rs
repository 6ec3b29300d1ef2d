//! Outbound connection pool
//!
//! Maintains a bounded set of warmed connections to one upstream base URL.
//! Each pooled connection owns its own `reqwest::Client` (and therefore its
//! own keep-alive socket pool), so health and lifecycle can be tracked per
//! connection instead of per process.
//!
//! The pool owns connections exclusively: an acquire hands out a healthy
//! idle connection, creates one while the pool has room, and otherwise
//! joins a FIFO wait bounded by `acquire_timeout`. Multiplexing many
//! requests onto one connection is the pipelining layer's job, never the
//! pool's.

pub mod pipeline;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

/// Pool tuning knobs, all overridable from configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub keep_alive_timeout: Duration,
    pub health_check_interval: Duration,
    /// Per-request upstream deadline applied to every client.
    pub request_timeout: Duration,
    pub enable_http2: bool,
    /// Create `min_connections` eagerly at startup.
    pub warm_pool: bool,
    pub enable_metrics: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            acquire_timeout: Duration::from_millis(5000),
            idle_timeout: Duration::from_millis(60_000),
            keep_alive_timeout: Duration::from_millis(30_000),
            health_check_interval: Duration::from_millis(30_000),
            request_timeout: Duration::from_secs(30),
            enable_http2: true,
            warm_pool: false,
            enable_metrics: true,
        }
    }
}

/// Acquisition failures surfaced to the proxy engine.
#[derive(Debug, PartialEq, Eq)]
pub enum PoolError {
    /// No connection became available within `acquire_timeout`.
    AcquireTimeout,
    /// The pool has been shut down.
    Closed,
    /// Building the underlying HTTP client failed.
    Build(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::AcquireTimeout => write!(f, "acquire_timeout"),
            PoolError::Closed => write!(f, "connection pool is shut down"),
            PoolError::Build(msg) => write!(f, "failed to build connection: {}", msg),
        }
    }
}

impl std::error::Error for PoolError {}

/// One warmed connection.
struct PooledConnection {
    id: u64,
    client: reqwest::Client,
    created_at: Instant,
    last_used_at: Instant,
    request_count: u64,
    /// Exclusively checked out by a live handle.
    in_use: bool,
    healthy: bool,
    last_health_check: Option<Instant>,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<(u64, reqwest::Client)>,
}

struct PoolInner {
    conns: Vec<PooledConnection>,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    total_acquired: u64,
    total_created: u64,
    total_retired: u64,
    acquire_timeouts: u64,
    total_requests: u64,
    failed_requests: u64,
    wait_micros_total: u64,
    wait_samples: u64,
    /// Recent request durations (ms) for percentile estimates.
    durations_ms: VecDeque<u64>,
}

const DURATION_RING: usize = 1024;

/// Point-in-time pool metrics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolMetricsSnapshot {
    pub active_connections: usize,
    pub idle_connections: usize,
    pub total_connections: usize,
    pub total_acquired: u64,
    pub total_created: u64,
    pub total_retired: u64,
    pub acquire_timeouts: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub duration_p50_ms: u64,
    pub duration_p95_ms: u64,
    pub duration_p99_ms: u64,
    pub avg_wait_us: u64,
    pub utilization_pct: f64,
}

/// Pool of warmed connections to a single upstream base URL.
pub struct ConnectionPool {
    base_url: String,
    config: PoolConfig,
    inner: Mutex<PoolInner>,
    counters: Mutex<PoolCounters>,
    next_conn_id: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(base_url: impl Into<String>, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            base_url: base_url.into(),
            config,
            inner: Mutex::new(PoolInner {
                conns: Vec::new(),
                waiters: VecDeque::new(),
                next_waiter_id: 1,
            }),
            counters: Mutex::new(PoolCounters::default()),
            next_conn_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Eagerly create connections up to `min_connections`.
    pub fn warm(self: &Arc<Self>) -> Result<(), PoolError> {
        let mut inner = self.lock_inner();
        while inner.conns.len() < self.config.min_connections {
            let conn = self.new_connection()?;
            inner.conns.push(conn);
        }
        Ok(())
    }

    /// Borrow a connection exclusively. Prefers a healthy idle connection,
    /// creates one if the pool has room, and otherwise waits FIFO (bounded
    /// by `acquire_timeout`) for a release, a health recovery, or a
    /// replacement.
    pub async fn acquire(self: &Arc<Self>) -> Result<ConnectionHandle, PoolError> {
        let wait_started = Instant::now();
        let (waiter_id, rx) = {
            let mut inner = self.lock_inner();
            if self.closed.load(Ordering::Acquire) {
                return Err(PoolError::Closed);
            }
            if let Some((id, client)) = Self::select_idle(&mut inner) {
                drop(inner);
                self.note_acquired(wait_started);
                return Ok(self.handle(id, client));
            }
            if inner.conns.len() < self.config.max_connections {
                let mut conn = self.new_connection()?;
                conn.in_use = true;
                let id = conn.id;
                let client = conn.client.clone();
                inner.conns.push(conn);
                drop(inner);
                self.note_acquired(wait_started);
                return Ok(self.handle(id, client));
            }
            let (tx, rx) = oneshot::channel();
            let waiter_id = inner.next_waiter_id;
            inner.next_waiter_id += 1;
            inner.waiters.push_back(Waiter { id: waiter_id, tx });
            (waiter_id, rx)
        };

        match tokio::time::timeout(self.config.acquire_timeout, rx).await {
            Ok(Ok((id, client))) => {
                self.note_acquired(wait_started);
                Ok(self.handle(id, client))
            }
            Ok(Err(_)) => Err(PoolError::Closed),
            Err(_) => {
                let mut inner = self.lock_inner();
                inner.waiters.retain(|w| w.id != waiter_id);
                drop(inner);
                if let Ok(mut counters) = self.counters.lock() {
                    counters.acquire_timeouts += 1;
                }
                Err(PoolError::AcquireTimeout)
            }
        }
    }

    /// Check out a healthy idle connection, if one exists.
    fn select_idle(inner: &mut PoolInner) -> Option<(u64, reqwest::Client)> {
        let pick = inner
            .conns
            .iter_mut()
            .find(|c| c.healthy && !c.in_use)?;
        pick.in_use = true;
        Some((pick.id, pick.client.clone()))
    }

    fn handle(self: &Arc<Self>, id: u64, client: reqwest::Client) -> ConnectionHandle {
        ConnectionHandle {
            pool: self.clone(),
            id,
            client,
        }
    }

    fn note_acquired(&self, wait_started: Instant) {
        if !self.config.enable_metrics {
            return;
        }
        if let Ok(mut counters) = self.counters.lock() {
            counters.total_acquired += 1;
            counters.wait_micros_total += wait_started.elapsed().as_micros() as u64;
            counters.wait_samples += 1;
        }
    }

    fn new_connection(&self) -> Result<PooledConnection, PoolError> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.config.request_timeout)
            .connect_timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(self.config.keep_alive_timeout);
        if !self.config.enable_http2 {
            // Some providers reset HTTP/2 connections under load; HTTP/1.1
            // keep-alive is the safe fallback.
            builder = builder.http1_only();
        }
        let client = builder
            .build()
            .map_err(|e| PoolError::Build(e.to_string()))?;

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut counters) = self.counters.lock() {
            counters.total_created += 1;
        }
        tracing::debug!(conn_id = id, base_url = %self.base_url, "pool: created connection");
        Ok(PooledConnection {
            id,
            client,
            created_at: Instant::now(),
            last_used_at: Instant::now(),
            request_count: 0,
            in_use: false,
            healthy: true,
            last_health_check: None,
        })
    }

    /// Return a checkout. Wakes FIFO waiters while a healthy idle
    /// connection is available.
    fn release(&self, id: u64) {
        let mut inner = self.lock_inner();
        if let Some(conn) = inner.conns.iter_mut().find(|c| c.id == id) {
            conn.in_use = false;
            conn.last_used_at = Instant::now();
            conn.request_count += 1;
        }
        Self::grant_waiters(&mut inner);
    }

    fn grant_waiters(inner: &mut PoolInner) {
        while !inner.waiters.is_empty() {
            let Some((id, client)) = Self::select_idle(inner) else {
                break;
            };
            // A waiter that timed out drops its receiver; undo and retry.
            let Some(waiter) = inner.waiters.pop_front() else {
                Self::mark_idle(inner, id);
                break;
            };
            if waiter.tx.send((id, client)).is_err() {
                Self::mark_idle(inner, id);
            }
        }
    }

    fn mark_idle(inner: &mut PoolInner, id: u64) {
        if let Some(conn) = inner.conns.iter_mut().find(|c| c.id == id) {
            conn.in_use = false;
        }
    }

    /// Record one completed upstream request against the pool's metrics.
    pub fn record_request(&self, duration: Duration, success: bool) {
        if !self.config.enable_metrics {
            return;
        }
        let Ok(mut counters) = self.counters.lock() else {
            return;
        };
        counters.total_requests += 1;
        if !success {
            counters.failed_requests += 1;
        }
        if counters.durations_ms.len() >= DURATION_RING {
            counters.durations_ms.pop_front();
        }
        counters.durations_ms.push_back(duration.as_millis() as u64);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Spawn the background probe/retire loop. The task exits once the pool
    /// is shut down.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(pool.config.health_check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if pool.closed.load(Ordering::Acquire) {
                    break;
                }
                pool.run_maintenance().await;
            }
        })
    }

    /// One maintenance pass: probe every connection, retire the unhealthy
    /// and the long-idle (above `min_connections`), replenish to the
    /// minimum, then wake waiters.
    pub async fn run_maintenance(self: &Arc<Self>) {
        let probes: Vec<(u64, reqwest::Client)> = {
            let inner = self.lock_inner();
            inner.conns.iter().map(|c| (c.id, c.client.clone())).collect()
        };

        let mut results = Vec::with_capacity(probes.len());
        for (id, client) in probes {
            let healthy = match tokio::time::timeout(
                Duration::from_secs(5),
                client.get(&self.base_url).send(),
            )
            .await
            {
                // Any HTTP response means the connection path works; upstream
                // status codes are not the probe's concern.
                Ok(Ok(_)) => true,
                Ok(Err(e)) => {
                    tracing::warn!(conn_id = id, error = %e, "pool: health probe failed");
                    false
                }
                Err(_) => {
                    tracing::warn!(conn_id = id, "pool: health probe timed out");
                    false
                }
            };
            results.push((id, healthy));
        }

        let mut retired = 0u64;
        {
            let mut inner = self.lock_inner();
            let now = Instant::now();
            for (id, healthy) in results {
                if let Some(conn) = inner.conns.iter_mut().find(|c| c.id == id) {
                    conn.healthy = healthy;
                    conn.last_health_check = Some(now);
                }
            }

            // Retire unhealthy connections that nothing is borrowing.
            inner.conns.retain(|c| {
                let keep = c.healthy || c.in_use;
                if !keep {
                    retired += 1;
                }
                keep
            });

            // Retire long-idle connections while the pool stays at its floor.
            let min = self.config.min_connections;
            let idle_cutoff = self.config.idle_timeout;
            let mut len = inner.conns.len();
            inner.conns.retain(|c| {
                if len > min
                    && !c.in_use
                    && c.last_used_at.elapsed() > idle_cutoff
                {
                    len -= 1;
                    retired += 1;
                    false
                } else {
                    true
                }
            });

            while inner.conns.len() < self.config.min_connections {
                match self.new_connection() {
                    Ok(conn) => inner.conns.push(conn),
                    Err(e) => {
                        tracing::error!(error = %e, "pool: failed to replenish connection");
                        break;
                    }
                }
            }

            Self::grant_waiters(&mut inner);
        }

        if retired > 0 {
            if let Ok(mut counters) = self.counters.lock() {
                counters.total_retired += retired;
            }
            tracing::debug!(retired, "pool: retired connections");
        }
    }

    /// Shut the pool down: fail pending waiters, refuse new acquires.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let mut inner = self.lock_inner();
        inner.waiters.clear();
        tracing::info!(base_url = %self.base_url, "pool: shut down");
    }

    pub fn metrics(&self) -> PoolMetricsSnapshot {
        let (active, idle, total) = {
            let inner = self.lock_inner();
            let active = inner.conns.iter().filter(|c| c.in_use).count();
            (active, inner.conns.len() - active, inner.conns.len())
        };
        let counters = self.counters.lock().expect("pool counters lock");
        let mut sorted: Vec<u64> = counters.durations_ms.iter().copied().collect();
        sorted.sort_unstable();
        PoolMetricsSnapshot {
            active_connections: active,
            idle_connections: idle,
            total_connections: total,
            total_acquired: counters.total_acquired,
            total_created: counters.total_created,
            total_retired: counters.total_retired,
            acquire_timeouts: counters.acquire_timeouts,
            total_requests: counters.total_requests,
            failed_requests: counters.failed_requests,
            duration_p50_ms: percentile(&sorted, 0.50),
            duration_p95_ms: percentile(&sorted, 0.95),
            duration_p99_ms: percentile(&sorted, 0.99),
            avg_wait_us: if counters.wait_samples > 0 {
                counters.wait_micros_total / counters.wait_samples
            } else {
                0
            },
            utilization_pct: if total > 0 {
                (active as f64 / total as f64) * 100.0
            } else {
                0.0
            },
        }
    }

    /// Per-connection diagnostics for the admin surface.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let inner = self.lock_inner();
        inner
            .conns
            .iter()
            .map(|c| ConnectionInfo {
                id: c.id,
                base_url: self.base_url.clone(),
                in_use: c.in_use,
                age_secs: c.created_at.elapsed().as_secs(),
                idle_secs: c.last_used_at.elapsed().as_secs(),
                request_count: c.request_count,
                healthy: c.healthy,
                last_health_check_secs_ago: c.last_health_check.map(|t| t.elapsed().as_secs()),
            })
            .collect()
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().expect("pool lock")
    }

    #[cfg(test)]
    pub(crate) fn set_connection_health(&self, id: u64, healthy: bool) {
        let mut inner = self.lock_inner();
        if let Some(conn) = inner.conns.iter_mut().find(|c| c.id == id) {
            conn.healthy = healthy;
        }
        if healthy {
            Self::grant_waiters(&mut inner);
        }
    }

    #[cfg(test)]
    pub(crate) fn connection_count(&self) -> usize {
        self.lock_inner().conns.len()
    }

    #[cfg(test)]
    pub(crate) fn connection_ages(&self) -> Vec<Duration> {
        self.lock_inner()
            .conns
            .iter()
            .map(|c| c.created_at.elapsed())
            .collect()
    }
}

/// Per-connection diagnostic row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionInfo {
    pub id: u64,
    pub base_url: String,
    pub in_use: bool,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub request_count: u64,
    pub healthy: bool,
    pub last_health_check_secs_ago: Option<u64>,
}

/// A borrowed connection. Dropping it returns the checkout to the pool.
pub struct ConnectionHandle {
    pool: Arc<ConnectionPool>,
    id: u64,
    client: reqwest::Client,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle").field("id", &self.id).finish()
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

/// Nearest-rank percentile over an already-sorted slice.
pub(crate) fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((sorted.len() as f64) * p).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> PoolConfig {
        PoolConfig {
            min_connections: 1,
            max_connections: 3,
            acquire_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_acquire_reuses_idle_connection() {
        let pool = ConnectionPool::new("http://127.0.0.1:1", test_config());
        let first = pool.acquire().await.unwrap();
        let first_id = first.id();
        drop(first);
        let second = pool.acquire().await.unwrap();
        assert_eq!(second.id(), first_id);
        assert_eq!(pool.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_acquire_creates_up_to_max_when_busy() {
        let pool = ConnectionPool::new("http://127.0.0.1:1", test_config());
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        assert_eq!(pool.connection_count(), 3);
        // A distinct connection per busy checkout.
        assert_ne!(a.id(), b.id());
        assert_ne!(b.id(), c.id());
    }

    #[tokio::test]
    async fn test_full_pool_waits_for_release() {
        let mut config = test_config();
        config.max_connections = 2;
        config.acquire_timeout = Duration::from_secs(5);
        let pool = ConnectionPool::new("http://127.0.0.1:1", config);
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        let first_id = first.id();

        // A full pool of busy connections is never shared: the third caller
        // parks in the waiter queue until a release.
        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let granted = waiter.await.unwrap().unwrap();
        assert_eq!(granted.id(), first_id);
        assert_eq!(pool.connection_count(), 2);
        drop(second);
    }

    #[tokio::test]
    async fn test_zero_timeout_fails_fast_when_nothing_free() {
        let mut config = test_config();
        config.max_connections = 1;
        config.acquire_timeout = Duration::ZERO;
        let pool = ConnectionPool::new("http://127.0.0.1:1", config);
        // The only connection is checked out and the pool is full: a busy
        // pool fails the acquire immediately.
        let _held = pool.acquire().await.unwrap();
        assert_eq!(pool.acquire().await.unwrap_err(), PoolError::AcquireTimeout);
        assert_eq!(pool.metrics().acquire_timeouts, 1);
    }

    #[tokio::test]
    async fn test_waiters_are_granted_fifo() {
        let mut config = test_config();
        config.max_connections = 1;
        config.acquire_timeout = Duration::from_secs(5);
        let pool = ConnectionPool::new("http://127.0.0.1:1", config);
        let held = pool.acquire().await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut waiters = Vec::new();
        for n in 1..=2u8 {
            let pool = pool.clone();
            let order = order.clone();
            waiters.push(tokio::spawn(async move {
                let handle = pool.acquire().await.unwrap();
                order.lock().unwrap().push(n);
                drop(handle);
            }));
            // Give each waiter time to enqueue before the next.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        drop(held);
        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_waiter_is_granted_on_health_recovery() {
        let mut config = test_config();
        config.max_connections = 1;
        config.acquire_timeout = Duration::from_secs(5);
        let pool = ConnectionPool::new("http://127.0.0.1:1", config);
        let conn_id = {
            let held = pool.acquire().await.unwrap();
            held.id()
        };
        // Idle but unhealthy: nothing to hand out, nothing to create.
        pool.set_connection_health(conn_id, false);

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.set_connection_health(conn_id, true);
        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(handle.id(), conn_id);
    }

    #[tokio::test]
    async fn test_maintenance_retires_unreachable_and_replenishes() {
        let pool = ConnectionPool::new("http://127.0.0.1:1", test_config());
        // Grow to three connections, then release them all.
        let handles: Vec<_> = futures::future::try_join_all((0..3).map(|_| pool.acquire()))
            .await
            .unwrap();
        drop(handles);
        assert_eq!(pool.connection_count(), 3);

        // Probes against an unreachable upstream fail; everything is
        // retired and the pool replenishes to its floor.
        pool.run_maintenance().await;
        assert_eq!(pool.connection_count(), 1);
        let ages = pool.connection_ages();
        assert!(ages.iter().all(|age| *age < Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_shutdown_refuses_acquire() {
        let pool = ConnectionPool::new("http://127.0.0.1:1", test_config());
        pool.shutdown();
        assert_eq!(pool.acquire().await.unwrap_err(), PoolError::Closed);
    }

    #[tokio::test]
    async fn test_request_metrics_percentiles() {
        let pool = ConnectionPool::new("http://127.0.0.1:1", test_config());
        for ms in [10u64, 20, 30, 40, 100] {
            pool.record_request(Duration::from_millis(ms), ms != 100);
        }
        let m = pool.metrics();
        assert_eq!(m.total_requests, 5);
        assert_eq!(m.failed_requests, 1);
        assert_eq!(m.duration_p50_ms, 30);
        assert_eq!(m.duration_p99_ms, 100);
    }

    #[test]
    fn test_percentile_edges() {
        assert_eq!(percentile(&[], 0.5), 0);
        assert_eq!(percentile(&[7], 0.5), 7);
        assert_eq!(percentile(&[1, 2, 3, 4], 0.5), 2);
        assert_eq!(percentile(&[1, 2, 3, 4], 0.99), 4);
    }
}
