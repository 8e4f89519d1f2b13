// SPDX-FileCopyrightText: 2025 The swarmseed Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// A file some peer advertised on a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub file_hash: String,
    pub file_name: String,
    pub file_size: u64,
    pub topic: String,
    pub seeders: BTreeSet<String>,
}

/// Remote files known through discovery, keyed by hash.
#[derive(Debug, Default)]
pub struct RemoteListing {
    files: Mutex<HashMap<String, RemoteFile>>,
}

impl RemoteListing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the file, or merges its seeders into the existing entry.
    pub fn add(&self, file: RemoteFile) -> RemoteFile {
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        let entry = files
            .entry(file.file_hash.clone())
            .and_modify(|existing| existing.seeders.extend(file.seeders.iter().cloned()))
            .or_insert(file);
        entry.clone()
    }

    pub fn get(&self, file_hash: &str) -> Option<RemoteFile> {
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files.get(file_hash).cloned()
    }

    pub fn all(&self) -> Vec<RemoteFile> {
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<RemoteFile> = files.values().cloned().collect();
        all.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        all
    }

    /// Removes `addr` from every entry and drops entries left without
    /// seeders. Returns the hashes that were dropped.
    pub fn remove_seeder(&self, addr: &str) -> Vec<String> {
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        let mut dropped = Vec::new();
        files.retain(|file_hash, file| {
            file.seeders.remove(addr);
            if file.seeders.is_empty() {
                dropped.push(file_hash.clone());
                false
            } else {
                true
            }
        });
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(file_hash: &str, name: &str, seeders: &[&str]) -> RemoteFile {
        RemoteFile {
            file_hash: file_hash.to_string(),
            file_name: name.to_string(),
            file_size: 42,
            topic: "t".to_string(),
            seeders: seeders.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_add_merges_seeders() {
        let listing = RemoteListing::new();
        listing.add(remote("h", "a", &["p1"]));
        let merged = listing.add(remote("h", "a", &["p2", "p1"]));
        assert_eq!(merged.seeders.len(), 2);
        assert_eq!(listing.all().len(), 1);
    }

    #[test]
    fn test_remove_seeder_drops_orphans() {
        let listing = RemoteListing::new();
        listing.add(remote("h1", "b", &["p1"]));
        listing.add(remote("h2", "a", &["p1", "p2"]));

        assert_eq!(listing.remove_seeder("p1"), vec!["h1".to_string()]);
        let all = listing.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].file_hash, "h2");
        assert!(listing.get("h1").is_none());
        assert!(listing.remove_seeder("p1").is_empty());
    }
}
