//! Tenant store
//!
//! Persistent mapping from API key to tenant record with a hot-reload
//! contract: any mutation that returns success is visible on the very next
//! lookup in this process, and on disk before create/update/delete return.
//! Usage accounting is the one exception - it lands in memory immediately
//! (lookups lead the disk) and is flushed in batches no more than one second
//! apart to keep write amplification down.
//!
//! Two backends implement the same narrow interface: a single JSON document
//! on disk and an embedded SQLite database. When the preferred backend
//! cannot be opened at start, the store falls back to file mode, keeps
//! retrying the primary in the background, and switches back (with a
//! `storage_switch` diagnostic) once it recovers. A fallback never accepts a
//! write it cannot persist - backend failures propagate to the caller.

mod file;
mod sqlite;

pub use file::FileBackend;
pub use sqlite::SqliteBackend;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::events::{Broadcaster, DashboardEvent, UsageSnapshot};
use crate::limiter::{Decision, RateLimiter};
use crate::tenant::{millis_to_rfc3339, FieldError, TenantPatch, TenantRecord};

/// Store failures. `Conflict`/`NotFound`/`Validation` map straight onto the
/// admin surface; `Backend` covers IO and database trouble.
#[derive(Debug)]
pub enum StoreError {
    Conflict,
    NotFound,
    Validation(Vec<FieldError>),
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Conflict => write!(f, "key already exists"),
            StoreError::NotFound => write!(f, "key not found"),
            StoreError::Validation(errors) => write!(f, "validation failed ({} fields)", errors.len()),
            StoreError::Backend(msg) => write!(f, "storage backend error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Narrow persistence interface shared by every backend. The store front
/// owns all caching and locking; backends only move records to and from
/// durable storage.
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn load_all(&self) -> Result<Vec<TenantRecord>, StoreError>;
    fn upsert(&self, record: &TenantRecord) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
    fn persist_all(&self, records: &[TenantRecord]) -> Result<(), StoreError>;
}

/// Store construction parameters.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// JSON document path; also the fallback target when SQLite is primary.
    pub data_file: PathBuf,
    /// When set, SQLite is the preferred backend.
    pub sqlite_path: Option<PathBuf>,
    /// Upper bound on how long recorded usage may sit unflushed.
    pub flush_interval: Duration,
    /// How often a degraded store retries its primary backend.
    pub primary_retry_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_file: PathBuf::from("./data/keys.json"),
            sqlite_path: None,
            flush_interval: Duration::from_secs(1),
            primary_retry_interval: Duration::from_secs(30),
        }
    }
}

struct ActiveBackend {
    backend: Box<dyn StorageBackend>,
    is_fallback: bool,
}

/// The tenant store front: in-memory records under per-key locks, a swap-in
/// persistence backend behind them.
pub struct TenantStore {
    tenants: RwLock<HashMap<String, Arc<Mutex<TenantRecord>>>>,
    active: Mutex<ActiveBackend>,
    limiter: Arc<RateLimiter>,
    broadcaster: Broadcaster,
    dirty: Mutex<HashSet<String>>,
    config: StoreConfig,
}

impl TenantStore {
    /// Open the store, preferring SQLite when configured and falling back to
    /// the file backend if the primary cannot be opened.
    pub fn open(
        config: StoreConfig,
        limiter: Arc<RateLimiter>,
        broadcaster: Broadcaster,
    ) -> Result<Arc<Self>, StoreError> {
        let (backend, is_fallback): (Box<dyn StorageBackend>, bool) = match &config.sqlite_path {
            Some(db_path) => match SqliteBackend::open(db_path) {
                Ok(backend) => (Box::new(backend), false),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        db_path = %db_path.display(),
                        "primary storage unavailable, falling back to file backend"
                    );
                    (Box::new(FileBackend::open(config.data_file.clone())?), true)
                }
            },
            None => (Box::new(FileBackend::open(config.data_file.clone())?), false),
        };

        let records = backend.load_all()?;
        tracing::info!(
            backend = backend.name(),
            keys = records.len(),
            "tenant store loaded"
        );

        let mut map = HashMap::with_capacity(records.len());
        for record in records {
            map.insert(record.key.clone(), Arc::new(Mutex::new(record)));
        }

        Ok(Arc::new(Self {
            tenants: RwLock::new(map),
            active: Mutex::new(ActiveBackend {
                backend,
                is_fallback,
            }),
            limiter,
            broadcaster,
            dirty: Mutex::new(HashSet::new()),
            config,
        }))
    }

    /// True while the store is running on its fallback backend.
    pub fn is_degraded(&self) -> bool {
        self.active.lock().map(|a| a.is_fallback).unwrap_or(false)
    }

    /// Open the store over an arbitrary backend. Lets tests inject failure
    /// modes no real backend produces on demand.
    #[cfg(test)]
    pub(crate) fn open_with_backend(
        backend: Box<dyn StorageBackend>,
        limiter: Arc<RateLimiter>,
        broadcaster: Broadcaster,
    ) -> Result<Arc<Self>, StoreError> {
        let records = backend.load_all()?;
        let mut map = HashMap::with_capacity(records.len());
        for record in records {
            map.insert(record.key.clone(), Arc::new(Mutex::new(record)));
        }
        Ok(Arc::new(Self {
            tenants: RwLock::new(map),
            active: Mutex::new(ActiveBackend {
                backend,
                is_fallback: false,
            }),
            limiter,
            broadcaster,
            dirty: Mutex::new(HashSet::new()),
            config: StoreConfig::default(),
        }))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Snapshot one record. Reflects every accepted mutation, including
    /// usage that has not hit disk yet.
    pub fn lookup(&self, key: &str) -> Option<TenantRecord> {
        let cell = {
            let tenants = self.tenants.read().ok()?;
            tenants.get(key)?.clone()
        };
        let record = cell.lock().ok()?;
        Some(record.clone())
    }

    /// Run `f` against the live record under its per-key lock.
    pub fn with_tenant<T>(&self, key: &str, f: impl FnOnce(&mut TenantRecord) -> T) -> Option<T> {
        let cell = {
            let tenants = self.tenants.read().ok()?;
            tenants.get(key)?.clone()
        };
        let mut record = cell.lock().ok()?;
        Some(f(&mut record))
    }

    /// Snapshot every record. Snapshot-consistent per call.
    pub fn iterate(&self) -> Vec<TenantRecord> {
        let cells: Vec<Arc<Mutex<TenantRecord>>> = match self.tenants.read() {
            Ok(tenants) => tenants.values().cloned().collect(),
            Err(_) => return Vec::new(),
        };
        cells
            .iter()
            .filter_map(|cell| cell.lock().ok().map(|r| r.clone()))
            .collect()
    }

    /// Rate-limit check against the live record. `None` when the key does
    /// not exist.
    pub fn check_rate(&self, key: &str, tokens_hint: u64, now_millis: i64) -> Option<Decision> {
        self.with_tenant(key, |record| {
            self.limiter.check(record, tokens_hint, now_millis)
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Admin mutations (write-through)
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a new record. Fails with `Conflict` when the key exists; the
    /// record is on disk before this returns.
    pub fn create(&self, record: TenantRecord) -> Result<TenantRecord, StoreError> {
        // The admin layer validates at the edge; re-check the record
        // invariants here so a malformed record can never reach storage.
        let mut errors = Vec::new();
        if record.key.trim().is_empty() {
            errors.push(FieldError::new("key", "must not be empty"));
        }
        if crate::tenant::validate_name(&record.name).is_err() {
            errors.push(FieldError::new("name", "must be 1..=255 characters"));
        }
        if record.token_limit_per_5h == 0 {
            errors.push(FieldError::new("token_limit_per_5h", "must be positive"));
        }
        if record.expiry_date <= record.created_at {
            errors.push(FieldError::new("expiry_date", "must be after created_at"));
        }
        if !errors.is_empty() {
            return Err(StoreError::Validation(errors));
        }

        {
            let mut tenants = self
                .tenants
                .write()
                .map_err(|_| StoreError::Backend("tenant map poisoned".into()))?;
            if tenants.contains_key(&record.key) {
                return Err(StoreError::Conflict);
            }
            tenants.insert(record.key.clone(), Arc::new(Mutex::new(record.clone())));
        }

        if let Err(e) = self.persist_one(&record) {
            // Roll the map back so memory never claims a key that storage
            // refused.
            if let Ok(mut tenants) = self.tenants.write() {
                tenants.remove(&record.key);
            }
            return Err(e);
        }

        self.limiter.invalidate(&record.key);
        self.broadcaster.publish(DashboardEvent::KeyCreated {
            timestamp: Utc::now(),
            data: record.clone(),
        });
        tracing::info!(key_prefix = %key_prefix(&record.key), "tenant key created");
        Ok(record)
    }

    /// Apply a validated patch. The updated record is on disk before this
    /// returns; a patch the backend refuses is rolled back and never
    /// becomes visible to lookups.
    pub fn update(&self, key: &str, patch: ValidatedPatch) -> Result<TenantRecord, StoreError> {
        let (previous, updated) = self
            .with_tenant(key, |record| {
                let previous = record.clone();
                if let Some(name) = patch.name.clone() {
                    record.name = name;
                }
                if let Some(model) = patch.model.clone() {
                    record.model = model;
                }
                if let Some(limit) = patch.token_limit_per_5h {
                    record.token_limit_per_5h = limit;
                }
                if let Some(expiry) = patch.expiry_date_millis {
                    record.expiry_date = expiry;
                }
                (previous, record.clone())
            })
            .ok_or(StoreError::NotFound)?;

        if let Err(e) = self.persist_one(&updated) {
            // Restore the prior record so the failed update never takes
            // effect in memory.
            let _ = self.with_tenant(key, move |record| *record = previous);
            return Err(e);
        }
        self.limiter.invalidate(key);
        self.broadcaster.publish(DashboardEvent::KeyUpdated {
            timestamp: Utc::now(),
            data: updated.clone(),
        });
        tracing::info!(key_prefix = %key_prefix(key), "tenant key updated");
        Ok(updated)
    }

    /// Remove a record. `NotFound` when absent; gone from disk before this
    /// returns. If the backend refuses the removal, the record is put back
    /// and the key keeps working.
    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        let removed = {
            let mut tenants = self
                .tenants
                .write()
                .map_err(|_| StoreError::Backend("tenant map poisoned".into()))?;
            tenants.remove(key).ok_or(StoreError::NotFound)?
        };

        let locked = match removed.lock() {
            Ok(r) => Some(r.clone()),
            Err(_) => None,
        };
        let record = match locked {
            Some(r) => r,
            None => {
                self.restore_tenant(key, removed);
                return Err(StoreError::Backend("tenant record poisoned".into()));
            }
        };

        let backend_result = self
            .lock_backend()
            .and_then(|active| active.backend.remove(key));
        if let Err(e) = backend_result {
            self.restore_tenant(key, removed);
            return Err(e);
        }

        if let Ok(mut dirty) = self.dirty.lock() {
            dirty.remove(key);
        }
        self.limiter.invalidate(key);
        self.broadcaster.publish(DashboardEvent::KeyDeleted {
            timestamp: Utc::now(),
            data: record,
        });
        tracing::info!(key_prefix = %key_prefix(key), "tenant key deleted");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Usage accounting (batched)
    // ─────────────────────────────────────────────────────────────────────────

    /// Charge tokens to a key. In-memory state updates immediately; the disk
    /// write rides the next flush tick. `model_at_time_of_use` is the model
    /// the request actually ran under, which can differ from the record's
    /// current binding when an admin update raced the request.
    pub fn record_usage(
        &self,
        key: &str,
        tokens: u64,
        model_at_time_of_use: &str,
        now_millis: i64,
    ) -> Result<(), StoreError> {
        self.with_tenant(key, |record| {
            self.limiter.record(record, tokens, now_millis);
            let used = record.rolling_window.total(now_millis);
            let snapshot = UsageSnapshot {
                key: record.key.clone(),
                name: record.name.clone(),
                model: model_at_time_of_use.to_string(),
                tokens_used: used,
                total_lifetime_tokens: record.lifetime_tokens,
                remaining_quota: record.token_limit_per_5h.saturating_sub(used),
                window_start: record
                    .rolling_window
                    .oldest_bucket_start()
                    .map(millis_to_rfc3339),
                window_end: millis_to_rfc3339(record.rolling_window.window_ends_at(now_millis)),
                is_expired: record.is_expired(now_millis),
            };
            // Published under the per-key lock: subscribers see usage events
            // for one key in the order the charges were accepted.
            self.broadcaster.publish(DashboardEvent::UsageUpdated {
                timestamp: Utc::now(),
                data: snapshot,
            });
        })
        .ok_or(StoreError::NotFound)?;

        if let Ok(mut dirty) = self.dirty.lock() {
            dirty.insert(key.to_string());
        }
        Ok(())
    }

    /// Persist every record with unflushed usage. Failed writes stay dirty
    /// and retry on the next tick.
    pub fn flush_pending(&self) {
        let keys: Vec<String> = {
            let Ok(mut dirty) = self.dirty.lock() else {
                return;
            };
            std::mem::take(&mut *dirty).into_iter().collect()
        };
        if keys.is_empty() {
            return;
        }

        for key in keys {
            let Some(record) = self.lookup(&key) else {
                continue; // Deleted since it was marked dirty.
            };
            if let Err(e) = self.persist_one(&record) {
                tracing::warn!(key_prefix = %key_prefix(&key), error = %e, "usage flush failed, will retry");
                if let Ok(mut dirty) = self.dirty.lock() {
                    dirty.insert(key);
                }
            }
        }
    }

    /// Background loop: flush dirty usage every `flush_interval` and retry a
    /// degraded primary every `primary_retry_interval`.
    pub fn spawn_flush_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(store.config.flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_retry = Instant::now();
            loop {
                interval.tick().await;
                store.flush_pending();
                if store.is_degraded()
                    && last_retry.elapsed() >= store.config.primary_retry_interval
                {
                    last_retry = Instant::now();
                    store.try_restore_primary();
                }
            }
        })
    }

    /// Attempt to reopen the preferred backend and move the live state onto
    /// it.
    fn try_restore_primary(&self) {
        let Some(db_path) = self.config.sqlite_path.clone() else {
            return;
        };
        let restored = match SqliteBackend::open(&db_path) {
            Ok(backend) => backend,
            Err(e) => {
                tracing::debug!(error = %e, "primary storage still unavailable");
                return;
            }
        };

        let snapshot = self.iterate();
        if let Err(e) = restored.persist_all(&snapshot) {
            tracing::warn!(error = %e, "primary storage recovered but resync failed");
            return;
        }

        if let Ok(mut active) = self.active.lock() {
            active.backend = Box::new(restored);
            active.is_fallback = false;
            tracing::info!(
                backend = active.backend.name(),
                keys = snapshot.len(),
                "storage_switch: primary backend restored"
            );
        }
    }

    fn persist_one(&self, record: &TenantRecord) -> Result<(), StoreError> {
        let active = self.lock_backend()?;
        active.backend.upsert(record)
    }

    /// Put a removed record back after a failed delete. If another create
    /// took the key in the meantime, the newer record wins.
    fn restore_tenant(&self, key: &str, cell: Arc<Mutex<TenantRecord>>) {
        if let Ok(mut tenants) = self.tenants.write() {
            tenants.entry(key.to_string()).or_insert(cell);
        }
    }

    fn lock_backend(&self) -> Result<std::sync::MutexGuard<'_, ActiveBackend>, StoreError> {
        self.active
            .lock()
            .map_err(|_| StoreError::Backend("backend lock poisoned".into()))
    }
}

/// An admin patch whose fields have already passed validation. Building one
/// is the admin layer's job; the store applies it verbatim.
#[derive(Debug, Clone, Default)]
pub struct ValidatedPatch {
    pub name: Option<String>,
    pub model: Option<String>,
    pub token_limit_per_5h: Option<u64>,
    pub expiry_date_millis: Option<i64>,
}

impl ValidatedPatch {
    /// Validate a wire patch against the model allow-list and the clock.
    pub fn from_patch(
        patch: &TenantPatch,
        allowed_models: &[String],
        now_millis: i64,
    ) -> Result<Self, Vec<FieldError>> {
        let mut errors = Vec::new();
        let mut validated = ValidatedPatch::default();

        if let Some(name) = &patch.name {
            match crate::tenant::validate_name(name) {
                Ok(name) => validated.name = Some(name),
                Err(e) => errors.push(e),
            }
        }
        if let Some(model) = &patch.model {
            match crate::tenant::validate_model(model, allowed_models) {
                Ok(model) => validated.model = Some(model),
                Err(e) => errors.push(e),
            }
        }
        if let Some(limit) = patch.token_limit_per_5h {
            match crate::tenant::validate_token_limit(limit) {
                Ok(limit) => validated.token_limit_per_5h = Some(limit),
                Err(e) => errors.push(e),
            }
        }
        if let Some(expiry) = &patch.expiry_date {
            match crate::tenant::validate_expiry(expiry, now_millis) {
                Ok(millis) => validated.expiry_date_millis = Some(millis),
                Err(e) => errors.push(e),
            }
        }

        if errors.is_empty() {
            Ok(validated)
        } else {
            Err(errors)
        }
    }
}

/// Short non-sensitive prefix of a tenant key for log lines.
pub fn key_prefix(key: &str) -> String {
    let prefix: String = key.chars().take(8).collect();
    format!("{}…", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::RollingWindow;

    const T0: i64 = 1_700_000_100_000;

    fn record(key: &str) -> TenantRecord {
        TenantRecord {
            key: key.to_string(),
            name: format!("tenant {}", key),
            model: "glm-4.7".into(),
            token_limit_per_5h: 1000,
            created_at: T0,
            last_used: T0,
            expiry_date: T0 + 365 * 86_400_000,
            lifetime_tokens: 0,
            rolling_window: RollingWindow::default(),
        }
    }

    fn open_file_store(dir: &tempfile::TempDir) -> Arc<TenantStore> {
        let config = StoreConfig {
            data_file: dir.path().join("keys.json"),
            sqlite_path: None,
            ..Default::default()
        };
        TenantStore::open(config, Arc::new(RateLimiter::new()), Broadcaster::new(8)).unwrap()
    }

    #[test]
    fn test_create_then_lookup_hot_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_file_store(&dir);
        store.create(record("tg-one")).unwrap();
        let found = store.lookup("tg-one").unwrap();
        assert_eq!(found.name, "tenant tg-one");
    }

    #[test]
    fn test_create_rejects_invariant_violations() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_file_store(&dir);
        let mut bad = record("tg-bad");
        bad.name = "   ".into();
        bad.token_limit_per_5h = 0;
        match store.create(bad) {
            Err(StoreError::Validation(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected validation failure, got {:?}", other.map(|r| r.key)),
        }
        assert!(store.lookup("tg-bad").is_none());
    }

    #[test]
    fn test_create_duplicate_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_file_store(&dir);
        store.create(record("tg-dup")).unwrap();
        assert!(matches!(
            store.create(record("tg-dup")),
            Err(StoreError::Conflict)
        ));
    }

    #[test]
    fn test_update_visible_on_next_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_file_store(&dir);
        store.create(record("tg-up")).unwrap();
        let patch = ValidatedPatch {
            token_limit_per_5h: Some(5000),
            ..Default::default()
        };
        store.update("tg-up", patch).unwrap();
        assert_eq!(store.lookup("tg-up").unwrap().token_limit_per_5h, 5000);
    }

    #[test]
    fn test_delete_then_lookup_misses() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_file_store(&dir);
        store.create(record("tg-del")).unwrap();
        store.delete("tg-del").unwrap();
        assert!(store.lookup("tg-del").is_none());
        assert!(matches!(store.delete("tg-del"), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_usage_visible_before_flush() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_file_store(&dir);
        store.create(record("tg-use")).unwrap();
        store.record_usage("tg-use", 123, "glm-4.7", T0).unwrap();
        // No flush yet: in-memory state already leads the disk.
        let rec = store.lookup("tg-use").unwrap();
        assert_eq!(rec.lifetime_tokens, 123);
    }

    #[test]
    fn test_state_survives_reopen_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_file_store(&dir);
            store.create(record("tg-persist")).unwrap();
            store.record_usage("tg-persist", 777, "glm-4.7", T0).unwrap();
            store.flush_pending();
        }
        let store = open_file_store(&dir);
        let mut rec = store.lookup("tg-persist").unwrap();
        assert_eq!(rec.lifetime_tokens, 777);
        assert_eq!(rec.rolling_window.total(T0 + 1), 777);
    }

    #[test]
    fn test_record_usage_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_file_store(&dir);
        assert!(matches!(
            store.record_usage("tg-ghost", 10, "glm-4.7", T0),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_mutations_publish_events() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Broadcaster::new(16);
        let config = StoreConfig {
            data_file: dir.path().join("keys.json"),
            sqlite_path: None,
            ..Default::default()
        };
        let store =
            TenantStore::open(config, Arc::new(RateLimiter::new()), bus.clone()).unwrap();
        let mut sub = bus.subscribe();

        store.create(record("tg-events")).unwrap();
        store.record_usage("tg-events", 5, "glm-4.7", T0).unwrap();
        store.delete("tg-events").unwrap();

        let kinds: Vec<&'static str> = (0..3)
            .map(|_| {
                match futures::executor::block_on(sub.recv()).unwrap() {
                    DashboardEvent::KeyCreated { .. } => "created",
                    DashboardEvent::UsageUpdated { .. } => "usage",
                    DashboardEvent::KeyDeleted { .. } => "deleted",
                    _ => "other",
                }
            })
            .collect();
        assert_eq!(kinds, vec!["created", "usage", "deleted"]);
    }

    /// Backend whose writes can be failed on demand.
    struct FlakyBackend {
        fail_writes: Arc<std::sync::atomic::AtomicBool>,
    }

    impl FlakyBackend {
        fn failing(&self) -> bool {
            self.fail_writes.load(std::sync::atomic::Ordering::Relaxed)
        }
    }

    impl StorageBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn load_all(&self) -> Result<Vec<TenantRecord>, StoreError> {
            Ok(Vec::new())
        }

        fn upsert(&self, _record: &TenantRecord) -> Result<(), StoreError> {
            if self.failing() {
                Err(StoreError::Backend("injected write failure".into()))
            } else {
                Ok(())
            }
        }

        fn remove(&self, _key: &str) -> Result<(), StoreError> {
            if self.failing() {
                Err(StoreError::Backend("injected write failure".into()))
            } else {
                Ok(())
            }
        }

        fn persist_all(&self, _records: &[TenantRecord]) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn open_flaky_store() -> (Arc<TenantStore>, Arc<std::sync::atomic::AtomicBool>) {
        let fail_writes = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let backend = FlakyBackend {
            fail_writes: fail_writes.clone(),
        };
        let store = TenantStore::open_with_backend(
            Box::new(backend),
            Arc::new(RateLimiter::new()),
            Broadcaster::new(8),
        )
        .unwrap();
        (store, fail_writes)
    }

    #[test]
    fn test_failed_create_is_not_visible() {
        let (store, fail_writes) = open_flaky_store();
        fail_writes.store(true, std::sync::atomic::Ordering::Relaxed);
        assert!(matches!(
            store.create(record("tg-doomed")),
            Err(StoreError::Backend(_))
        ));
        assert!(store.lookup("tg-doomed").is_none());
    }

    #[test]
    fn test_failed_update_rolls_back() {
        let (store, fail_writes) = open_flaky_store();
        store.create(record("tg-roll")).unwrap();

        fail_writes.store(true, std::sync::atomic::Ordering::Relaxed);
        let patch = ValidatedPatch {
            token_limit_per_5h: Some(5000),
            name: Some("renamed".into()),
            ..Default::default()
        };
        assert!(matches!(
            store.update("tg-roll", patch),
            Err(StoreError::Backend(_))
        ));

        // The refused update never takes effect in memory.
        let rec = store.lookup("tg-roll").unwrap();
        assert_eq!(rec.token_limit_per_5h, 1000);
        assert_eq!(rec.name, "tenant tg-roll");
    }

    #[test]
    fn test_failed_delete_keeps_record() {
        let (store, fail_writes) = open_flaky_store();
        store.create(record("tg-sticky")).unwrap();

        fail_writes.store(true, std::sync::atomic::Ordering::Relaxed);
        assert!(matches!(
            store.delete("tg-sticky"),
            Err(StoreError::Backend(_))
        ));
        // The key is still there and still usable.
        assert!(store.lookup("tg-sticky").is_some());
        store
            .record_usage("tg-sticky", 7, "glm-4.7", T0)
            .unwrap();

        // Once the backend recovers, the delete goes through.
        fail_writes.store(false, std::sync::atomic::Ordering::Relaxed);
        store.delete("tg-sticky").unwrap();
        assert!(store.lookup("tg-sticky").is_none());
    }

    #[test]
    fn test_sqlite_unavailable_falls_back_to_file() {
        let dir = tempfile::tempdir().unwrap();
        // Point the SQLite path inside a regular file so the open fails.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let config = StoreConfig {
            data_file: dir.path().join("keys.json"),
            sqlite_path: Some(blocker.join("db.sqlite")),
            ..Default::default()
        };
        let store =
            TenantStore::open(config, Arc::new(RateLimiter::new()), Broadcaster::new(8)).unwrap();
        assert!(store.is_degraded());
        // The fallback still persists writes.
        store.create(record("tg-fallback")).unwrap();
        assert!(dir.path().join("keys.json").exists());
    }

    #[test]
    fn test_iterate_snapshots_all_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_file_store(&dir);
        store.create(record("tg-a")).unwrap();
        store.create(record("tg-b")).unwrap();
        let mut keys: Vec<String> = store.iterate().into_iter().map(|r| r.key).collect();
        keys.sort();
        assert_eq!(keys, vec!["tg-a", "tg-b"]);
    }
}
