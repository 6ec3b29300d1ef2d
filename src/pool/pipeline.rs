//! Request pipelining over pooled connections
//!
//! Bounds how many requests ride one connection concurrently. Submissions
//! over the cap wait in a per-connection priority queue (stable FIFO within
//! a priority level); the queue itself is bounded globally, and hitting that
//! bound is an explicit `backpressure` failure rather than an invisible
//! stall.
//!
//! Cancellation is exact: a caller that gives up while queued removes its
//! entry, and one that dies holding a slot releases it on drop, so active
//! count plus queue depth always equals the number of live callers.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::time::{Duration, Instant};

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use super::percentile;

/// Dispatch priority. `Critical` beats `High` beats `Normal` beats `Low`;
/// ties dispatch in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    /// BTreeMap sort key: smaller sorts first, so invert.
    fn inverted(self) -> u8 {
        3 - self as u8
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Pipelining knobs, all overridable from configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Concurrent in-flight requests allowed per connection.
    pub max_concurrent_per_connection: usize,
    /// Global bound across all per-connection queues.
    pub max_queue_size: usize,
    /// How long a submission may sit queued before failing.
    pub queue_timeout: Duration,
    /// When false, every submission is treated as `Normal`.
    pub enable_prioritization: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_connection: 6,
            max_queue_size: 100,
            queue_timeout: Duration::from_secs(10),
            enable_prioritization: true,
        }
    }
}

/// Submission failures surfaced to the proxy engine.
#[derive(Debug, PartialEq, Eq)]
pub enum PipelineError {
    /// The global queue is full.
    Backpressure,
    /// The submission sat queued past `queue_timeout`.
    QueueTimeout,
    /// The manager is draining; no new work is accepted.
    ShuttingDown,
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Backpressure => write!(f, "backpressure"),
            PipelineError::QueueTimeout => write!(f, "queue_timeout"),
            PipelineError::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

impl std::error::Error for PipelineError {}

struct QueuedEntry {
    tx: oneshot::Sender<()>,
    enqueued_at: Instant,
}

/// Queue key: (inverted priority, sequence). BTreeMap order then yields
/// highest priority first and FIFO within a priority.
type QueueKey = (u8, u64);

struct PipeInner {
    /// Live slots per connection id.
    active: HashMap<u64, usize>,
    /// Waiting submissions per connection id.
    queues: HashMap<u64, BTreeMap<QueueKey, QueuedEntry>>,
    queued_total: usize,
    next_seq: u64,
    total_active: usize,
    peak_concurrency: usize,
    shutting_down: bool,
}

#[derive(Debug, Default)]
struct PipeCounters {
    total_executed: u64,
    total_queued: u64,
    backpressure_events: u64,
    queue_timeouts: u64,
    /// Executions that shared their connection with at least one other
    /// in-flight request.
    pipelined_requests: u64,
    by_priority: [u64; 4],
    queue_wait_us: VecDeque<u64>,
}

const WAIT_RING: usize = 1024;

/// Point-in-time pipelining metrics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineMetricsSnapshot {
    pub active_requests: usize,
    pub queue_depth: usize,
    pub total_executed: u64,
    pub total_queued: u64,
    pub backpressure_events: u64,
    pub queue_timeouts: u64,
    pub pipelined_requests: u64,
    pub by_priority: [u64; 4],
    pub peak_concurrency: usize,
    pub queue_wait_p50_us: u64,
    pub queue_wait_p95_us: u64,
    pub queue_wait_p99_us: u64,
}

/// Multiplexes requests onto pooled connections under a per-connection cap.
pub struct PipeliningManager {
    config: PipelineConfig,
    inner: Mutex<PipeInner>,
    counters: Mutex<PipeCounters>,
}

impl PipeliningManager {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(PipeInner {
                active: HashMap::new(),
                queues: HashMap::new(),
                queued_total: 0,
                next_seq: 0,
                total_active: 0,
                peak_concurrency: 0,
                shutting_down: false,
            }),
            counters: Mutex::new(PipeCounters::default()),
        }
    }

    /// Run `fut` as one request on `conn_id`, waiting for a slot if the
    /// connection is already at its concurrency cap.
    pub async fn execute<F, T>(
        self: &Arc<Self>,
        conn_id: u64,
        priority: Priority,
        fut: F,
    ) -> Result<T, PipelineError>
    where
        F: Future<Output = T>,
    {
        let permit = self.acquire(conn_id, priority).await?;
        let result = fut.await;
        drop(permit);
        Ok(result)
    }

    /// Reserve one in-flight slot on `conn_id`. The permit is released on
    /// drop, so callers may hold it across response streaming.
    pub async fn acquire(
        self: &Arc<Self>,
        conn_id: u64,
        priority: Priority,
    ) -> Result<ExecutionPermit, PipelineError> {
        let priority = if self.config.enable_prioritization {
            priority
        } else {
            Priority::Normal
        };

        let (mut rx, key) = {
            let mut guard = self.lock_inner();
            let inner = &mut *guard;
            if inner.shutting_down {
                return Err(PipelineError::ShuttingDown);
            }
            let active = inner.active.entry(conn_id).or_insert(0);
            if *active < self.config.max_concurrent_per_connection {
                *active += 1;
                let shared = *active > 1;
                inner.total_active += 1;
                inner.peak_concurrency = inner.peak_concurrency.max(inner.total_active);
                drop(guard);
                self.note_executed(priority, shared, None);
                return Ok(ExecutionPermit {
                    mgr: self.clone(),
                    conn_id,
                });
            }
            if inner.queued_total >= self.config.max_queue_size {
                drop(guard);
                if let Ok(mut counters) = self.counters.lock() {
                    counters.backpressure_events += 1;
                }
                return Err(PipelineError::Backpressure);
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let key = (priority.inverted(), seq);
            let (tx, rx) = oneshot::channel();
            inner.queues.entry(conn_id).or_default().insert(
                key,
                QueuedEntry {
                    tx,
                    enqueued_at: Instant::now(),
                },
            );
            inner.queued_total += 1;
            (rx, key)
        };

        if let Ok(mut counters) = self.counters.lock() {
            counters.total_queued += 1;
        }

        // Removes the entry if the caller is dropped while still queued, so
        // cancellation never leaves a phantom submission behind.
        let mut waiter = QueueWaiter {
            mgr: self,
            conn_id,
            key,
            armed: true,
        };

        match tokio::time::timeout(self.config.queue_timeout, &mut rx).await {
            Ok(Ok(())) => {
                waiter.armed = false;
                Ok(ExecutionPermit {
                    mgr: self.clone(),
                    conn_id,
                })
            }
            Ok(Err(_)) => {
                // Sender dropped: the queue was drained by shutdown.
                waiter.armed = false;
                Err(PipelineError::ShuttingDown)
            }
            Err(_) => {
                waiter.armed = false;
                if self.remove_queued(conn_id, key) {
                    if let Ok(mut counters) = self.counters.lock() {
                        counters.queue_timeouts += 1;
                    }
                    Err(PipelineError::QueueTimeout)
                } else if rx.try_recv().is_ok() {
                    // A grant raced the deadline; give the slot straight back.
                    self.release_slot(conn_id);
                    if let Ok(mut counters) = self.counters.lock() {
                        counters.queue_timeouts += 1;
                    }
                    Err(PipelineError::QueueTimeout)
                } else {
                    Err(PipelineError::ShuttingDown)
                }
            }
        }
    }

    /// Give a slot back and hand it to the best queued submission, if any.
    fn release_slot(&self, conn_id: u64) {
        let mut granted_wait: Option<Duration> = None;
        let mut granted_priority: Option<Priority> = None;
        let mut shared = false;
        {
            let mut guard = self.lock_inner();
            let inner = &mut *guard;
            if let Some(active) = inner.active.get_mut(&conn_id) {
                *active = active.saturating_sub(1);
            }
            inner.total_active = inner.total_active.saturating_sub(1);

            loop {
                let Some(queue) = inner.queues.get_mut(&conn_id) else {
                    break;
                };
                let Some((&key, _)) = queue.iter().next() else {
                    break;
                };
                let entry = queue.remove(&key).expect("key just observed");
                inner.queued_total -= 1;

                let active = inner.active.entry(conn_id).or_insert(0);
                *active += 1;
                shared = *active > 1;
                inner.total_active += 1;
                inner.peak_concurrency = inner.peak_concurrency.max(inner.total_active);

                if entry.tx.send(()).is_ok() {
                    granted_wait = Some(entry.enqueued_at.elapsed());
                    granted_priority = Some(match key.0 {
                        0 => Priority::Critical,
                        1 => Priority::High,
                        2 => Priority::Normal,
                        _ => Priority::Low,
                    });
                    break;
                }
                // Receiver gone (cancelled between dequeue and grant): undo
                // and try the next entry.
                if let Some(active) = inner.active.get_mut(&conn_id) {
                    *active -= 1;
                }
                inner.total_active -= 1;
            }
        }

        if let Some(priority) = granted_priority {
            self.note_executed(priority, shared, granted_wait);
        }
    }

    fn remove_queued(&self, conn_id: u64, key: QueueKey) -> bool {
        let mut inner = self.lock_inner();
        let removed = inner
            .queues
            .get_mut(&conn_id)
            .and_then(|q| q.remove(&key))
            .is_some();
        if removed {
            inner.queued_total -= 1;
        }
        removed
    }

    fn note_executed(&self, priority: Priority, shared: bool, wait: Option<Duration>) {
        let Ok(mut counters) = self.counters.lock() else {
            return;
        };
        counters.total_executed += 1;
        counters.by_priority[priority.index()] += 1;
        if shared {
            counters.pipelined_requests += 1;
        }
        if let Some(wait) = wait {
            if counters.queue_wait_us.len() >= WAIT_RING {
                counters.queue_wait_us.pop_front();
            }
            counters.queue_wait_us.push_back(wait.as_micros() as u64);
        }
    }

    /// Stop accepting work and reject everything still queued. Active
    /// requests run to completion.
    pub fn shutdown(&self) {
        let drained = {
            let mut inner = self.lock_inner();
            inner.shutting_down = true;
            let drained = inner.queued_total;
            inner.queues.clear();
            inner.queued_total = 0;
            drained
        };
        if drained > 0 {
            tracing::info!(rejected = drained, "pipeline: shutdown rejected queued requests");
        }
    }

    pub fn metrics(&self) -> PipelineMetricsSnapshot {
        let (active_requests, queue_depth, peak_concurrency) = {
            let inner = self.lock_inner();
            (inner.total_active, inner.queued_total, inner.peak_concurrency)
        };
        let counters = self.counters.lock().expect("pipeline counters lock");
        let mut sorted: Vec<u64> = counters.queue_wait_us.iter().copied().collect();
        sorted.sort_unstable();
        PipelineMetricsSnapshot {
            active_requests,
            queue_depth,
            total_executed: counters.total_executed,
            total_queued: counters.total_queued,
            backpressure_events: counters.backpressure_events,
            queue_timeouts: counters.queue_timeouts,
            pipelined_requests: counters.pipelined_requests,
            by_priority: counters.by_priority,
            peak_concurrency,
            queue_wait_p50_us: percentile(&sorted, 0.50),
            queue_wait_p95_us: percentile(&sorted, 0.95),
            queue_wait_p99_us: percentile(&sorted, 0.99),
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, PipeInner> {
        self.inner.lock().expect("pipeline lock")
    }
}

/// Held for the duration of one in-flight request, including response
/// streaming. Dropping it releases the slot and dispatches queued work.
pub struct ExecutionPermit {
    mgr: Arc<PipeliningManager>,
    conn_id: u64,
}

impl Drop for ExecutionPermit {
    fn drop(&mut self) {
        self.mgr.release_slot(self.conn_id);
    }
}

/// Cleans up a queued submission whose caller went away.
struct QueueWaiter<'a> {
    mgr: &'a PipeliningManager,
    conn_id: u64,
    key: QueueKey,
    armed: bool,
}

impl Drop for QueueWaiter<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.mgr.remove_queued(self.conn_id, self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn manager(cap: usize, queue: usize, timeout: Duration) -> Arc<PipeliningManager> {
        Arc::new(PipeliningManager::new(PipelineConfig {
            max_concurrent_per_connection: cap,
            max_queue_size: queue,
            queue_timeout: timeout,
            enable_prioritization: true,
        }))
    }

    #[tokio::test]
    async fn test_executes_immediately_under_cap() {
        let mgr = manager(2, 10, Duration::from_secs(1));
        let out = mgr.execute(1, Priority::Normal, async { 42 }).await.unwrap();
        assert_eq!(out, 42);
        let m = mgr.metrics();
        assert_eq!(m.total_executed, 1);
        assert_eq!(m.active_requests, 0);
    }

    #[tokio::test]
    async fn test_fifo_within_equal_priority() {
        let mgr = manager(1, 10, Duration::from_secs(5));
        let gate = Arc::new(tokio::sync::Notify::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        // Occupy the single slot.
        let holder = {
            let mgr = mgr.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                mgr.execute(1, Priority::Normal, async move {
                    gate.notified().await;
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Queue three equal-priority submissions in order.
        let mut tasks = Vec::new();
        for i in 0..3 {
            let mgr = mgr.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                mgr.execute(1, Priority::Normal, async move {
                    order.lock().unwrap().push(i);
                })
                .await
            }));
            // Give each submission time to enqueue before the next.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        gate.notify_one();
        holder.await.unwrap().unwrap();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_critical_preempts_queued_normal() {
        let mgr = manager(1, 10, Duration::from_secs(5));
        let gate = Arc::new(tokio::sync::Notify::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let holder = {
            let mgr = mgr.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                mgr.execute(1, Priority::Normal, async move {
                    gate.notified().await;
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut tasks = Vec::new();
        for (label, priority) in [("normal", Priority::Normal), ("critical", Priority::Critical)] {
            let mgr = mgr.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                mgr.execute(1, priority, async move {
                    order.lock().unwrap().push(label);
                })
                .await
            }));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        gate.notify_one();
        holder.await.unwrap().unwrap();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        // The later CRITICAL submission dispatches before the earlier NORMAL.
        assert_eq!(*order.lock().unwrap(), vec!["critical", "normal"]);
    }

    #[tokio::test]
    async fn test_backpressure_when_queue_full() {
        // Pipelining cap 6, queue cap 10: sixteen submissions fit, the
        // seventeenth is refused.
        let mgr = manager(6, 10, Duration::from_secs(5));
        let gate = Arc::new(tokio::sync::Notify::new());

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let mgr = mgr.clone();
            let gate = gate.clone();
            tasks.push(tokio::spawn(async move {
                mgr.execute(1, Priority::Normal, async move {
                    gate.notified().await;
                })
                .await
            }));
        }
        // Let all sixteen settle into slots or the queue.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let m = mgr.metrics();
        assert_eq!(m.active_requests, 6);
        assert_eq!(m.queue_depth, 10);

        let err = mgr
            .execute(1, Priority::Normal, async {})
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::Backpressure);
        assert_eq!(mgr.metrics().backpressure_events, 1);

        gate.notify_waiters();
        // Waiters park again after each grant wave; keep waking until done.
        for task in tasks {
            loop {
                gate.notify_waiters();
                tokio::time::sleep(Duration::from_millis(5)).await;
                if task.is_finished() {
                    break;
                }
            }
            task.await.unwrap().unwrap();
        }
        assert_eq!(mgr.metrics().active_requests, 0);
    }

    #[tokio::test]
    async fn test_queue_timeout() {
        let mgr = manager(1, 10, Duration::from_millis(30));
        let gate = Arc::new(tokio::sync::Notify::new());
        let holder = {
            let mgr = mgr.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                mgr.execute(1, Priority::Normal, async move {
                    gate.notified().await;
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = mgr
            .execute(1, Priority::Normal, async {})
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::QueueTimeout);
        assert_eq!(mgr.metrics().queue_timeouts, 1);
        assert_eq!(mgr.metrics().queue_depth, 0);

        gate.notify_one();
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_no_phantom() {
        let mgr = manager(1, 10, Duration::from_secs(5));
        let gate = Arc::new(tokio::sync::Notify::new());
        let holder = {
            let mgr = mgr.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                mgr.execute(1, Priority::Normal, async move {
                    gate.notified().await;
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let queued = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.execute(1, Priority::Normal, async {}).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mgr.metrics().queue_depth, 1);

        queued.abort();
        let _ = queued.await;
        // One live caller (the holder), one active slot, empty queue.
        assert_eq!(mgr.metrics().queue_depth, 0);
        assert_eq!(mgr.metrics().active_requests, 1);

        gate.notify_one();
        holder.await.unwrap().unwrap();
        assert_eq!(mgr.metrics().active_requests, 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_and_queued() {
        let mgr = manager(1, 10, Duration::from_secs(5));
        let gate = Arc::new(tokio::sync::Notify::new());
        let holder = {
            let mgr = mgr.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                mgr.execute(1, Priority::Normal, async move {
                    gate.notified().await;
                    "done"
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let queued = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.execute(1, Priority::Normal, async {}).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        mgr.shutdown();
        assert_eq!(
            queued.await.unwrap().unwrap_err(),
            PipelineError::ShuttingDown
        );
        assert_eq!(
            mgr.execute(1, Priority::Normal, async {}).await.unwrap_err(),
            PipelineError::ShuttingDown
        );

        // The active request is allowed to complete.
        gate.notify_one();
        assert_eq!(holder.await.unwrap().unwrap(), "done");
    }
}
