//! Dashboard events and the broadcaster
//!
//! Key-lifecycle and usage events fan out to every live dashboard
//! subscriber. Delivery is best-effort per subscriber: each one owns a
//! bounded buffer, a slow consumer loses its oldest messages first (counted
//! as `slow_consumer` drops), and no subscriber can ever block another or
//! the publishing path.
//!
//! Per-subscriber order is FIFO. Per-key event order holds because the
//! tenant store publishes under its per-key write serialization; there is no
//! global total order across subscribers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::tenant::TenantRecord;

/// Default bound on a subscriber's pending-event buffer.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Envelope pushed to dashboard subscribers.
/// Serializes as `{"type": "...", "timestamp": ..., ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum DashboardEvent {
    /// Greeting sent to a subscriber right after it attaches.
    #[serde(rename = "connected")]
    Connected {
        timestamp: DateTime<Utc>,
        message: String,
    },

    #[serde(rename = "key_created")]
    KeyCreated {
        timestamp: DateTime<Utc>,
        data: TenantRecord,
    },

    #[serde(rename = "key_updated")]
    KeyUpdated {
        timestamp: DateTime<Utc>,
        data: TenantRecord,
    },

    #[serde(rename = "key_deleted")]
    KeyDeleted {
        timestamp: DateTime<Utc>,
        data: TenantRecord,
    },

    /// Emitted after usage accounting lands for a key.
    #[serde(rename = "usage_updated")]
    UsageUpdated {
        timestamp: DateTime<Utc>,
        data: UsageSnapshot,
    },
}

/// Usage payload for `usage_updated`.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub key: String,
    pub name: String,
    pub model: String,
    pub tokens_used: u64,
    pub total_lifetime_tokens: u64,
    pub remaining_quota: u64,
    /// ISO-8601; start of the oldest live bucket, if any.
    pub window_start: Option<String>,
    /// ISO-8601; when the current window frees up.
    pub window_end: String,
    pub is_expired: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Broadcaster
// ─────────────────────────────────────────────────────────────────────────────

/// One subscriber's bounded mailbox. The publisher pushes under the lock and
/// drops oldest-first when full; the subscriber task drains on notify.
struct Mailbox {
    pending: Mutex<VecDeque<DashboardEvent>>,
    notify: tokio::sync::Notify,
    capacity: usize,
    /// Set when the broadcaster shuts down so drains can terminate.
    closed: AtomicBool,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: tokio::sync::Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the number of messages dropped to make room.
    fn push(&self, event: DashboardEvent) -> u64 {
        let mut dropped = 0;
        if let Ok(mut pending) = self.pending.lock() {
            while pending.len() >= self.capacity {
                pending.pop_front();
                dropped += 1;
            }
            pending.push_back(event);
        }
        self.notify.notify_one();
        dropped
    }
}

/// Handle held by a subscriber task. Dropping it detaches the subscriber.
pub struct Subscription {
    id: u64,
    mailbox: Arc<Mailbox>,
    broadcaster: Broadcaster,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once the broadcaster has shut
    /// down and the mailbox is drained.
    pub async fn recv(&mut self) -> Option<DashboardEvent> {
        loop {
            if let Ok(mut pending) = self.mailbox.pending.lock() {
                if let Some(event) = pending.pop_front() {
                    return Some(event);
                }
            }
            if self.mailbox.closed.load(Ordering::Acquire) {
                return None;
            }
            self.mailbox.notify.notified().await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.id);
    }
}

struct BroadcasterInner {
    subscribers: Mutex<HashMap<u64, Arc<Mailbox>>>,
    next_id: AtomicU64,
    slow_consumer_drops: AtomicU64,
    buffer_capacity: usize,
}

/// Fan-out of dashboard events. Cheap to clone; all clones share the same
/// subscriber set.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<BroadcasterInner>,
}

impl Broadcaster {
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BroadcasterInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                slow_consumer_drops: AtomicU64::new(0),
                buffer_capacity: buffer_capacity.max(1),
            }),
        }
    }

    /// Attach a subscriber. The caller owns the returned subscription and
    /// should drain it promptly; a full mailbox sheds oldest events.
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mailbox = Arc::new(Mailbox::new(self.inner.buffer_capacity));
        if let Ok(mut subs) = self.inner.subscribers.lock() {
            subs.insert(id, mailbox.clone());
        }
        Subscription {
            id,
            mailbox,
            broadcaster: self.clone(),
        }
    }

    fn unsubscribe(&self, id: u64) {
        if let Ok(mut subs) = self.inner.subscribers.lock() {
            subs.remove(&id);
        }
    }

    /// Deliver an event to every live subscriber. Never blocks; a slow
    /// consumer only loses its own oldest messages.
    pub fn publish(&self, event: DashboardEvent) {
        let mailboxes: Vec<Arc<Mailbox>> = match self.inner.subscribers.lock() {
            Ok(subs) => subs.values().cloned().collect(),
            Err(_) => return,
        };
        for mailbox in mailboxes {
            let dropped = mailbox.push(event.clone());
            if dropped > 0 {
                self.inner
                    .slow_consumer_drops
                    .fetch_add(dropped, Ordering::Relaxed);
                tracing::debug!(dropped, "slow_consumer: dashboard subscriber shed events");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Total events shed across all slow consumers since start.
    pub fn slow_consumer_drops(&self) -> u64 {
        self.inner.slow_consumer_drops.load(Ordering::Relaxed)
    }

    /// Mark every mailbox closed and wake the drain loops.
    pub fn shutdown(&self) {
        if let Ok(subs) = self.inner.subscribers.lock() {
            for mailbox in subs.values() {
                mailbox.closed.store(true, Ordering::Release);
                mailbox.notify.notify_one();
            }
        }
    }
}
