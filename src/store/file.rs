//! File-backed storage: one JSON document
//!
//! The whole key set lives in a single `{"keys": [...]}` document. Writes
//! are atomic (write to a temp file in the same directory, then rename) and
//! guarded by a lock directory next to the data file, so two writers in the
//! same process group can never interleave a document write.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::{StorageBackend, StoreError};
use crate::tenant::TenantRecord;

/// On-disk document shape.
#[derive(Debug, Default, Serialize, Deserialize)]
struct KeyDocument {
    keys: Vec<TenantRecord>,
}

/// JSON-document backend.
pub struct FileBackend {
    path: PathBuf,
    /// Serializes read-modify-write cycles inside this process.
    write_lock: Mutex<()>,
}

impl FileBackend {
    /// Open (and create parent directories for) the document at `path`.
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    fn read_document(&self) -> Result<KeyDocument, StoreError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(KeyDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomic document replacement: temp file in the same directory, flush,
    /// rename over the original.
    fn write_document(&self, doc: &KeyDocument) -> Result<(), StoreError> {
        let _file_lock = LockDir::acquire(&self.path)?;
        let tmp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(doc)?;
        {
            let mut tmp = fs::File::create(&tmp_path)?;
            tmp.write_all(&json)?;
            tmp.flush()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn mutate(&self, f: impl FnOnce(&mut KeyDocument)) -> Result<(), StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Backend("file write lock poisoned".into()))?;
        let mut doc = self.read_document()?;
        f(&mut doc);
        self.write_document(&doc)
    }
}

impl StorageBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn load_all(&self) -> Result<Vec<TenantRecord>, StoreError> {
        Ok(self.read_document()?.keys)
    }

    fn upsert(&self, record: &TenantRecord) -> Result<(), StoreError> {
        self.mutate(|doc| {
            match doc.keys.iter_mut().find(|r| r.key == record.key) {
                Some(existing) => *existing = record.clone(),
                None => doc.keys.push(record.clone()),
            }
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.mutate(|doc| doc.keys.retain(|r| r.key != key))
    }

    fn persist_all(&self, records: &[TenantRecord]) -> Result<(), StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Backend("file write lock poisoned".into()))?;
        self.write_document(&KeyDocument {
            keys: records.to_vec(),
        })
    }
}

/// Lock directory guard. `mkdir` is atomic on every platform we care about,
/// so holding the directory is holding the lock; the directory is removed on
/// drop. A stale lock older than the timeout is broken and taken over.
struct LockDir {
    path: PathBuf,
}

const LOCK_WAIT: Duration = Duration::from_secs(5);
const LOCK_POLL: Duration = Duration::from_millis(25);

impl LockDir {
    fn acquire(data_path: &Path) -> Result<Self, StoreError> {
        let mut lock_path = data_path.as_os_str().to_owned();
        lock_path.push(".lock");
        let path = PathBuf::from(lock_path);

        let started = Instant::now();
        loop {
            match fs::create_dir(&path) {
                Ok(()) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if started.elapsed() > LOCK_WAIT {
                        tracing::warn!(lock = %path.display(), "breaking stale storage lock");
                        let _ = fs::remove_dir(&path);
                        continue;
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for LockDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::RollingWindow;

    fn record(key: &str, lifetime: u64) -> TenantRecord {
        TenantRecord {
            key: key.to_string(),
            name: key.to_string(),
            model: "glm-4.7".into(),
            token_limit_per_5h: 1000,
            created_at: 1,
            last_used: 1,
            expiry_date: i64::MAX,
            lifetime_tokens: lifetime,
            rolling_window: RollingWindow::default(),
        }
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path().join("keys.json")).unwrap();
        assert!(backend.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_upsert_insert_and_replace() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path().join("keys.json")).unwrap();
        backend.upsert(&record("a", 1)).unwrap();
        backend.upsert(&record("b", 2)).unwrap();
        backend.upsert(&record("a", 10)).unwrap();

        let mut loaded = backend.load_all().unwrap();
        loaded.sort_by(|x, y| x.key.cmp(&y.key));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].lifetime_tokens, 10);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path().join("keys.json")).unwrap();
        backend.upsert(&record("a", 1)).unwrap();
        backend.remove("a").unwrap();
        backend.remove("a").unwrap();
        assert!(backend.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_no_temp_or_lock_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("keys.json");
        let backend = FileBackend::open(data.clone()).unwrap();
        backend.upsert(&record("a", 1)).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["keys.json".to_string()]);
    }

    #[test]
    fn test_persist_all_replaces_document() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path().join("keys.json")).unwrap();
        backend.upsert(&record("old", 1)).unwrap();
        backend
            .persist_all(&[record("new1", 2), record("new2", 3)])
            .unwrap();
        let mut keys: Vec<String> = backend
            .load_all()
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["new1", "new2"]);
    }
}
