// SPDX-FileCopyrightText: 2025 The swarmseed Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

use crate::bandwidth::FileRates;
use crate::catalog::FileState;
use crate::engine::Engine;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FileStatus {
    pub file_hash: String,
    pub file_name: String,
    pub file_size: u64,
    pub state: FileState,
    pub chunks_present: u64,
    pub num_chunks: u64,
    pub progress: f64,
    pub seeders: usize,
    pub upload_bps: f64,
    pub download_bps: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub run_time: u64,
    pub connected_peers: usize,
    pub total_upload_bps: f64,
    pub total_download_bps: f64,
    pub files: Vec<FileStatus>,
}

impl EngineStatus {
    pub fn capture(engine: &Engine, run_time: u64) -> Self {
        let rates = engine.bandwidth_rates();
        let mut files: Vec<FileStatus> = engine
            .files()
            .into_iter()
            .map(|record| {
                let rate = rates.get(&record.file_hash).copied().unwrap_or_default();
                FileStatus {
                    chunks_present: record.chunk_map.count(),
                    progress: record.progress(),
                    seeders: record.seeders.len(),
                    upload_bps: rate.upload_bps,
                    download_bps: rate.download_bps,
                    file_hash: record.file_hash,
                    file_name: record.file_name,
                    file_size: record.file_size,
                    state: record.state,
                    num_chunks: record.num_chunks,
                }
            })
            .collect();
        files.sort_by(|a, b| a.file_name.cmp(&b.file_name));

        Self {
            run_time,
            connected_peers: engine.connected_peers(),
            total_upload_bps: rates.values().map(|r: &FileRates| r.upload_bps).sum(),
            total_download_bps: rates.values().map(|r| r.download_bps).sum(),
            files,
        }
    }
}

pub fn status_path(data_dir: &Path) -> PathBuf {
    data_dir.join("status_files").join("engine_state.json")
}

pub fn write_snapshot(file_path: &Path, status: &EngineStatus) -> io::Result<()> {
    if let Some(parent) = file_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(status).map_err(io::Error::other)?;
    let temp_path = file_path.with_extension("json.tmp");
    std::fs::write(&temp_path, json)?;
    std::fs::rename(&temp_path, file_path)
}

pub fn read_snapshot(file_path: &Path) -> io::Result<EngineStatus> {
    let json = std::fs::read_to_string(file_path)?;
    serde_json::from_str(&json).map_err(io::Error::other)
}

/// Writes the snapshot on a blocking thread, giving up if the daemon shuts
/// down first.
pub fn dump(
    status: EngineStatus,
    data_dir: &Path,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) {
    let file_path = status_path(data_dir);
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                tracing::debug!("Status dump aborted due to shutdown");
            }
            result = tokio::task::spawn_blocking(move || write_snapshot(&file_path, &status)) => {
                if let Ok(Err(e)) = result {
                    tracing::error!("Failed to write status dump: {:?}", e);
                }
            }
        }
    });
}
