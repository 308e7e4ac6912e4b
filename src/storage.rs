use crate::error::StoreError;
use crate::models::FileRecord;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Persistent record store keyed by unique file path.
pub trait RecordStore: Send + Sync {
    fn lookup(&self, path: &str) -> Result<Option<FileRecord>, StoreError>;

    /// Inserts the record, replacing any record with the same path.
    fn upsert(&self, record: FileRecord) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<String, FileRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryRecordStore {
    fn lookup(&self, path: &str) -> Result<Option<FileRecord>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(records.get(path).cloned())
    }

    fn upsert(&self, record: FileRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        records.insert(record.path.clone(), record);
        Ok(())
    }
}

/// Records kept in one pretty-printed JSON file, rewritten on every upsert.
pub struct JsonRecordStore {
    file: PathBuf,
    records: Mutex<HashMap<String, FileRecord>>,
}

impl JsonRecordStore {
    pub fn open(file: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let file = file.into();
        let records = load_all(&file)?
            .into_iter()
            .map(|r| (r.path.clone(), r))
            .collect();
        Ok(Self {
            file,
            records: Mutex::new(records),
        })
    }
}

impl RecordStore for JsonRecordStore {
    fn lookup(&self, path: &str) -> Result<Option<FileRecord>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(records.get(path).cloned())
    }

    fn upsert(&self, record: FileRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        let previous = records.insert(record.path.clone(), record.clone());
        let mut all: Vec<&FileRecord> = records.values().collect();
        all.sort_by(|a, b| a.path.cmp(&b.path));
        if let Err(e) = save_all(&self.file, &all) {
            // Keep memory consistent with what is on disk.
            match previous {
                Some(previous) => records.insert(record.path.clone(), previous),
                None => records.remove(&record.path),
            };
            return Err(e);
        }
        debug!(path = %record.path, store = %self.file.display(), "record saved");
        Ok(())
    }
}

fn load_all(file: &Path) -> Result<Vec<FileRecord>, StoreError> {
    if !file.exists() {
        return Ok(Vec::new());
    }
    let s = fs::read_to_string(file).map_err(|source| StoreError::Io {
        path: file.to_path_buf(),
        source,
    })?;
    if s.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&s)?)
}

fn save_all(file: &Path, records: &[&FileRecord]) -> Result<(), StoreError> {
    let s = serde_json::to_string_pretty(records)?;
    if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| StoreError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(file, s).map_err(|source| StoreError::Io {
        path: file.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Algorithm, FileMeta};
    use chrono::DateTime;

    fn record(path: &str) -> FileRecord {
        let meta = FileMeta {
            name: "n".to_string(),
            path: path.to_string(),
            size: 1,
            last_modified: DateTime::from_timestamp_millis(5).unwrap(),
        };
        FileRecord::empty(&meta)
    }

    #[test]
    fn memory_store_keys_by_path() {
        let store = MemoryRecordStore::new();
        assert!(store.lookup("/a").unwrap().is_none());

        let mut r = record("/a");
        store.upsert(r.clone()).unwrap();
        r.set_digest(Algorithm::Md5, "00".to_string());
        store.upsert(r.clone()).unwrap();

        assert_eq!(store.lookup("/a").unwrap(), Some(r));
    }

    #[test]
    fn json_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("nested").join("records.json");

        let store = JsonRecordStore::open(&file).unwrap();
        let mut r = record("/b");
        r.set_digest(Algorithm::Sha256, "ab".to_string());
        store.upsert(r.clone()).unwrap();
        store.upsert(record("/a")).unwrap();

        let reopened = JsonRecordStore::open(&file).unwrap();
        assert_eq!(reopened.lookup("/b").unwrap(), Some(r));
        assert!(reopened.lookup("/a").unwrap().is_some());
        assert!(reopened.lookup("/c").unwrap().is_none());
    }

    #[test]
    fn json_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("records.json");
        fs::write(&file, "{not json").unwrap();
        assert!(matches!(JsonRecordStore::open(&file), Err(StoreError::Json(_))));
    }

    #[test]
    fn failed_write_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes every write fail.
        let file = dir.path().join("records.json");
        fs::create_dir(&file).unwrap();
        let store = JsonRecordStore {
            file: file.clone(),
            records: Mutex::new(HashMap::new()),
        };
        assert!(store.upsert(record("/a")).is_err());
        assert!(store.lookup("/a").unwrap().is_none());
    }
}
