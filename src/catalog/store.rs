// SPDX-FileCopyrightText: 2025 The swarmseed Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{event, Level};

use super::{is_valid_file_hash, FileRecord};
use crate::errors::StoreError;

/// Durable home of file records, keyed by file hash.
pub trait RecordStore: Send + Sync + 'static {
    fn get_file(&self, file_hash: &str) -> Result<Option<FileRecord>, StoreError>;
    fn get_all_files(&self) -> Result<Vec<FileRecord>, StoreError>;
    fn insert_or_update(&self, record: &FileRecord) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, FileRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    fn get_file(&self, file_hash: &str) -> Result<Option<FileRecord>, StoreError> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(file_hash).cloned())
    }

    fn get_all_files(&self) -> Result<Vec<FileRecord>, StoreError> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.values().cloned().collect())
    }

    fn insert_or_update(&self, record: &FileRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.insert(record.file_hash.clone(), record.clone());
        Ok(())
    }
}

/// One TOML document per file under a directory.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Path of the record for `file_hash`, with `suffix` appended. Hashes
    /// that could leave `root` are refused.
    fn record_path(&self, file_hash: &str, suffix: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_file_hash(file_hash) {
            return Err(StoreError::InvalidKey(file_hash.to_string()));
        }
        Ok(self.root.join(format!("{}{}", file_hash, suffix)))
    }

    fn read_record(path: &Path) -> Result<FileRecord, StoreError> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|source| StoreError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

impl RecordStore for DirStore {
    fn get_file(&self, file_hash: &str) -> Result<Option<FileRecord>, StoreError> {
        let path = self.record_path(file_hash, ".toml")?;
        match Self::read_record(&path) {
            Ok(record) => Ok(Some(record)),
            Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn get_all_files(&self) -> Result<Vec<FileRecord>, StoreError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            match Self::read_record(&path) {
                Ok(record) => records.push(record),
                Err(e) => {
                    event!(Level::WARN, path = %path.display(), "Skipping unreadable file record: {}", e);
                }
            }
        }
        Ok(records)
    }

    fn insert_or_update(&self, record: &FileRecord) -> Result<(), StoreError> {
        let record_path = self.record_path(&record.file_hash, ".toml")?;
        let temp_path = self.record_path(&record.file_hash, ".toml.tmp")?;
        let content = toml::to_string_pretty(record)?;
        fs::write(&temp_path, content)?;
        fs::rename(&temp_path, &record_path)?;
        Ok(())
    }
}

/// Wraps a `MemoryStore` and refuses the next `failures` writes of records
/// in `fail_state`.
#[cfg(test)]
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    fail_state: super::FileState,
    failures: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl FlakyStore {
    pub fn new(fail_state: super::FileState, failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_state,
            failures: std::sync::atomic::AtomicUsize::new(failures),
        }
    }
}

#[cfg(test)]
impl RecordStore for FlakyStore {
    fn get_file(&self, file_hash: &str) -> Result<Option<FileRecord>, StoreError> {
        self.inner.get_file(file_hash)
    }

    fn get_all_files(&self) -> Result<Vec<FileRecord>, StoreError> {
        self.inner.get_all_files()
    }

    fn insert_or_update(&self, record: &FileRecord) -> Result<(), StoreError> {
        use std::sync::atomic::Ordering;
        if record.state == self.fail_state
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StoreError::Io(io::Error::other("disk full")));
        }
        self.inner.insert_or_update(record)
    }
}
