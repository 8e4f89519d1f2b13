// SPDX-FileCopyrightText: 2025 The swarmseed Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod chunk_map;
pub mod listing;
pub mod store;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use strum_macros::EnumIter;
use tracing::{event, Level};

use crate::errors::{CatalogError, StoreError};
use crate::storage::num_chunks;
use chunk_map::ChunkMap;
use store::RecordStore;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum FileState {
    /// Advertised by a peer, nothing fetched yet.
    Discovered,
    Downloading,
    /// Local seed whose integrity pass has not finished.
    Hashing,
    Seeding,
    /// The backing file no longer resolves on disk.
    Missing,
}

impl FileState {
    pub fn can_transition_to(self, next: FileState) -> bool {
        use FileState::*;
        matches!(
            (self, next),
            (Discovered, Downloading)
                | (Downloading, Downloading)
                | (Downloading, Seeding)
                | (Downloading, Missing)
                | (Hashing, Seeding)
                | (Hashing, Missing)
                | (Seeding, Missing)
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub file_hash: String,
    pub file_name: String,
    pub file_size: u64,
    pub num_chunks: u64,
    pub local_path: PathBuf,
    pub topic: String,
    pub state: FileState,
    #[serde(default)]
    pub content_digest: Option<String>,
    #[serde(default)]
    pub seeders: BTreeSet<String>,
    pub chunk_map: ChunkMap,
}

impl FileRecord {
    /// A file we hold in full. It starts in `Hashing` until its integrity
    /// pass completes.
    pub fn local(
        file_hash: &str,
        file_name: &str,
        file_size: u64,
        local_path: PathBuf,
        topic: &str,
    ) -> Self {
        let chunks = num_chunks(file_size);
        Self {
            file_hash: file_hash.to_string(),
            file_name: file_name.to_string(),
            file_size,
            num_chunks: chunks,
            local_path,
            topic: topic.to_string(),
            state: FileState::Hashing,
            content_digest: None,
            seeders: BTreeSet::new(),
            chunk_map: ChunkMap::full(chunks),
        }
    }

    /// A file advertised by peers, with nothing present locally.
    pub fn remote(
        file_hash: &str,
        file_name: &str,
        file_size: u64,
        local_path: PathBuf,
        topic: &str,
        seeders: impl IntoIterator<Item = String>,
    ) -> Self {
        let chunks = num_chunks(file_size);
        Self {
            file_hash: file_hash.to_string(),
            file_name: file_name.to_string(),
            file_size,
            num_chunks: chunks,
            local_path,
            topic: topic.to_string(),
            state: FileState::Discovered,
            content_digest: None,
            seeders: seeders.into_iter().collect(),
            chunk_map: ChunkMap::empty(chunks),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.chunk_map.is_complete()
    }

    pub fn progress(&self) -> f64 {
        self.chunk_map.progress()
    }
}

const MAX_FILE_HASH_LEN: usize = 128;

/// File hashes travel between peers and name records on disk, so only
/// ASCII letters, digits, `-` and `_` are accepted.
pub fn is_valid_file_hash(file_hash: &str) -> bool {
    !file_hash.is_empty()
        && file_hash.len() <= MAX_FILE_HASH_LEN
        && file_hash
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Outcome of recording a chunk as present.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkMark {
    AlreadyPresent,
    Stored,
    /// The chunk was the last one missing; the file is now seeding.
    Completed(FileRecord),
}

/// In-memory view of every known file, mirrored to a record store. A
/// mutation only becomes visible in memory once the store accepted it.
pub struct Catalog {
    files: Mutex<HashMap<String, FileRecord>>,
    store: Arc<dyn RecordStore>,
    write_lock: tokio::sync::Mutex<()>,
}

impl Catalog {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            store,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, FileRecord>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replaces the in-memory view with whatever the record store holds.
    pub async fn load(&self) -> Result<Vec<FileRecord>, CatalogError> {
        let _guard = self.write_lock.lock().await;
        let store = self.store.clone();
        let records = tokio::task::spawn_blocking(move || store.get_all_files())
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;

        let mut files = self.lock();
        files.clear();
        for record in &records {
            files.insert(record.file_hash.clone(), record.clone());
        }
        event!(Level::INFO, count = records.len(), "Catalog loaded");
        Ok(records)
    }

    pub async fn create(&self, record: FileRecord) -> Result<(), CatalogError> {
        let _guard = self.write_lock.lock().await;
        if self.lock().contains_key(&record.file_hash) {
            return Err(CatalogError::AlreadyExists(record.file_hash));
        }
        self.write_through(record).await?;
        Ok(())
    }

    pub fn get(&self, file_hash: &str) -> Option<FileRecord> {
        self.lock().get(file_hash).cloned()
    }

    pub fn all(&self) -> Vec<FileRecord> {
        self.lock().values().cloned().collect()
    }

    pub fn find_by_path(&self, path: &Path) -> Option<FileRecord> {
        self.lock()
            .values()
            .find(|record| record.local_path == path)
            .cloned()
    }

    /// Sets the presence bit for a chunk. Setting a bit twice is a no-op.
    /// When the last bit lands the file flips to `Seeding`. If the store
    /// rejects the write the bit stays unset.
    pub async fn mark_chunk_present(
        &self,
        file_hash: &str,
        index: u64,
    ) -> Result<ChunkMark, CatalogError> {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .get(file_hash)
            .ok_or_else(|| CatalogError::NotFound(file_hash.to_string()))?;

        if index >= record.num_chunks {
            return Err(CatalogError::ChunkOutOfRange {
                file_hash: file_hash.to_string(),
                index,
            });
        }
        if record.chunk_map.is_set(index) {
            return Ok(ChunkMark::AlreadyPresent);
        }
        if record.state != FileState::Downloading {
            return Err(CatalogError::NotDownloading {
                file_hash: file_hash.to_string(),
                state: record.state,
            });
        }

        record.chunk_map.set(index);
        let completed = record.chunk_map.is_complete();
        if completed {
            record.state = FileState::Seeding;
        }
        let record = self.write_through(record).await?;

        if completed {
            event!(Level::INFO, file_hash, file_name = %record.file_name, "File complete, now seeding");
            Ok(ChunkMark::Completed(record))
        } else {
            Ok(ChunkMark::Stored)
        }
    }

    pub async fn transition(
        &self,
        file_hash: &str,
        next: FileState,
    ) -> Result<FileRecord, CatalogError> {
        self.update(file_hash, |record| {
            if !record.state.can_transition_to(next)
                || (next == FileState::Seeding && !record.is_complete())
            {
                return Err(CatalogError::InvalidTransition {
                    file_hash: record.file_hash.clone(),
                    from: record.state,
                    to: next,
                });
            }
            record.state = next;
            Ok(())
        })
        .await
    }

    /// Finishes an integrity pass: stores the digest and starts seeding.
    pub async fn finish_hashing(
        &self,
        file_hash: &str,
        digest: String,
    ) -> Result<FileRecord, CatalogError> {
        self.update(file_hash, |record| {
            if record.state != FileState::Hashing {
                return Err(CatalogError::InvalidTransition {
                    file_hash: record.file_hash.clone(),
                    from: record.state,
                    to: FileState::Seeding,
                });
            }
            record.content_digest = Some(digest);
            record.state = FileState::Seeding;
            Ok(())
        })
        .await
    }

    pub async fn add_seeders(
        &self,
        file_hash: &str,
        seeders: impl IntoIterator<Item = String>,
    ) -> Result<FileRecord, CatalogError> {
        self.update(file_hash, |record| {
            record.seeders.extend(seeders);
            Ok(())
        })
        .await
    }

    /// Drops `addr` from every seeder set. Returns the hashes that changed.
    /// Stops at the first record the store rejects; records written before
    /// it stay committed.
    pub async fn remove_seeder_everywhere(&self, addr: &str) -> Result<Vec<String>, CatalogError> {
        let _guard = self.write_lock.lock().await;
        let affected: Vec<FileRecord> = self
            .lock()
            .values()
            .filter(|record| record.seeders.contains(addr))
            .cloned()
            .collect();

        let mut changed = Vec::with_capacity(affected.len());
        for mut record in affected {
            record.seeders.remove(addr);
            let record = self.write_through(record).await?;
            changed.push(record.file_hash);
        }
        Ok(changed)
    }

    /// Writes `record` to the store, then makes it the in-memory view.
    pub async fn persist(&self, record: FileRecord) -> Result<FileRecord, CatalogError> {
        let _guard = self.write_lock.lock().await;
        self.write_through(record).await
    }

    /// Callers hold `write_lock`, so the record they started from is still
    /// the latest one.
    async fn write_through(&self, record: FileRecord) -> Result<FileRecord, CatalogError> {
        let store = self.store.clone();
        let stored = record.clone();
        tokio::task::spawn_blocking(move || store.insert_or_update(&stored))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;

        self.lock().insert(record.file_hash.clone(), record.clone());
        Ok(record)
    }

    async fn update<F>(&self, file_hash: &str, mutate: F) -> Result<FileRecord, CatalogError>
    where
        F: FnOnce(&mut FileRecord) -> Result<(), CatalogError>,
    {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .get(file_hash)
            .ok_or_else(|| CatalogError::NotFound(file_hash.to_string()))?;
        mutate(&mut record)?;
        self.write_through(record).await
    }
}
