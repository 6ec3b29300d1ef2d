//! Embedded SQLite storage
//!
//! One `keys` table, WAL mode, all access funneled through a mutex-guarded
//! connection. Rolling-window state rides along as a JSON column so the
//! window's own serialization stays the single source of truth for its
//! layout.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use super::{StorageBackend, StoreError};
use crate::tenant::TenantRecord;
use crate::window::RollingWindow;

/// SQLite-backed key storage.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl SqliteBackend {
    /// Open (creating directories and schema as needed) the database at
    /// `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS keys (
                key                TEXT PRIMARY KEY,
                name               TEXT NOT NULL,
                model              TEXT NOT NULL,
                token_limit_per_5h INTEGER NOT NULL,
                created_at         INTEGER NOT NULL,
                last_used          INTEGER NOT NULL,
                expiry_date        INTEGER NOT NULL,
                lifetime_tokens    INTEGER NOT NULL,
                rolling_window     TEXT NOT NULL
            )",
        )?;
        Ok(())
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("sqlite connection poisoned".into()))
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TenantRecord> {
        let window_json: String = row.get("rolling_window")?;
        let rolling_window = serde_json::from_str::<RollingWindow>(&window_json).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "corrupt rolling window state, resetting");
            RollingWindow::default()
        });
        Ok(TenantRecord {
            key: row.get("key")?,
            name: row.get("name")?,
            model: row.get("model")?,
            token_limit_per_5h: row.get::<_, i64>("token_limit_per_5h")? as u64,
            created_at: row.get("created_at")?,
            last_used: row.get("last_used")?,
            expiry_date: row.get("expiry_date")?,
            lifetime_tokens: row.get::<_, i64>("lifetime_tokens")? as u64,
            rolling_window,
        })
    }

    fn upsert_with(conn: &Connection, record: &TenantRecord) -> Result<(), StoreError> {
        let window_json = serde_json::to_string(&record.rolling_window)?;
        conn.execute(
            "INSERT INTO keys (key, name, model, token_limit_per_5h, created_at,
                               last_used, expiry_date, lifetime_tokens, rolling_window)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(key) DO UPDATE SET
                name = excluded.name,
                model = excluded.model,
                token_limit_per_5h = excluded.token_limit_per_5h,
                created_at = excluded.created_at,
                last_used = excluded.last_used,
                expiry_date = excluded.expiry_date,
                lifetime_tokens = excluded.lifetime_tokens,
                rolling_window = excluded.rolling_window",
            params![
                record.key,
                record.name,
                record.model,
                record.token_limit_per_5h as i64,
                record.created_at,
                record.last_used,
                record.expiry_date,
                record.lifetime_tokens as i64,
                window_json,
            ],
        )?;
        Ok(())
    }
}

impl StorageBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn load_all(&self) -> Result<Vec<TenantRecord>, StoreError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT * FROM keys")?;
        let rows = stmt.query_map([], Self::row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn upsert(&self, record: &TenantRecord) -> Result<(), StoreError> {
        let conn = self.lock_conn()?;
        Self::upsert_with(&conn, record)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM keys WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn persist_all(&self, records: &[TenantRecord]) -> Result<(), StoreError> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM keys", [])?;
        for record in records {
            Self::upsert_with(&tx, record)?;
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, lifetime: u64) -> TenantRecord {
        let mut rolling_window = RollingWindow::default();
        rolling_window.add(1_700_000_100_000, lifetime);
        TenantRecord {
            key: key.to_string(),
            name: key.to_string(),
            model: "glm-4.7".into(),
            token_limit_per_5h: 1000,
            created_at: 1,
            last_used: 1,
            expiry_date: i64::MAX,
            lifetime_tokens: lifetime,
            rolling_window,
        }
    }

    #[test]
    fn test_roundtrip_including_window_state() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::open(&dir.path().join("keys.sqlite")).unwrap();
        backend.upsert(&record("a", 55)).unwrap();

        let loaded = backend.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        let mut rec = loaded.into_iter().next().unwrap();
        assert_eq!(rec.lifetime_tokens, 55);
        assert_eq!(rec.rolling_window.total(1_700_000_100_001), 55);
    }

    #[test]
    fn test_upsert_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::open(&dir.path().join("keys.sqlite")).unwrap();
        backend.upsert(&record("a", 1)).unwrap();
        backend.upsert(&record("a", 2)).unwrap();
        let loaded = backend.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].lifetime_tokens, 2);
    }

    #[test]
    fn test_remove_and_persist_all() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::open(&dir.path().join("keys.sqlite")).unwrap();
        backend.upsert(&record("a", 1)).unwrap();
        backend.remove("a").unwrap();
        assert!(backend.load_all().unwrap().is_empty());

        backend
            .persist_all(&[record("x", 1), record("y", 2)])
            .unwrap();
        assert_eq!(backend.load_all().unwrap().len(), 2);
    }

    #[test]
    fn test_reopen_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.sqlite");
        {
            let backend = SqliteBackend::open(&path).unwrap();
            backend.upsert(&record("keep", 9)).unwrap();
        }
        let backend = SqliteBackend::open(&path).unwrap();
        assert_eq!(backend.load_all().unwrap()[0].lifetime_tokens, 9);
    }
}
