// SPDX-FileCopyrightText: 2025 The swarmseed Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs::{self, try_exists, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::errors::StorageError;
use crate::CHUNK_SIZE;

pub fn num_chunks(file_size: u64) -> u64 {
    file_size.div_ceil(CHUNK_SIZE)
}

/// Length of chunk `index`. Only the last chunk may be short.
pub fn chunk_len(file_size: u64, index: u64) -> Result<u64, StorageError> {
    let total = num_chunks(file_size);
    if index >= total {
        return Err(StorageError::ChunkOutOfRange {
            index,
            num_chunks: total,
        });
    }
    let start = index * CHUNK_SIZE;
    Ok(std::cmp::min(CHUNK_SIZE, file_size - start))
}

/// Creates parent directories and pre-sizes the file so chunks can be written
/// at any offset. An existing file keeps its contents.
pub async fn allocate_file(path: &Path, size: u64) -> Result<(), StorageError> {
    if let Some(parent_dir) = path.parent() {
        if !parent_dir.as_os_str().is_empty() && !try_exists(parent_dir).await? {
            fs::create_dir_all(parent_dir).await?;
        }
    }

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await?;
    if file.metadata().await?.len() != size {
        file.set_len(size).await?;
    }
    Ok(())
}

pub async fn file_size(path: &Path) -> Result<u64, StorageError> {
    Ok(fs::metadata(path).await?.len())
}

pub async fn read_chunk(path: &Path, file_size: u64, index: u64) -> Result<Vec<u8>, StorageError> {
    let len = chunk_len(file_size, index)?;

    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(index * CHUNK_SIZE)).await?;

    let mut buffer = vec![0u8; len as usize];
    file.read_exact(&mut buffer).await?;
    Ok(buffer)
}

pub async fn write_chunk(
    path: &Path,
    file_size: u64,
    index: u64,
    data: &[u8],
) -> Result<(), StorageError> {
    let expected = chunk_len(file_size, index)?;
    if data.len() as u64 != expected {
        return Err(StorageError::ChunkLength {
            index,
            expected,
            actual: data.len() as u64,
        });
    }

    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(index * CHUNK_SIZE)).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

/// Reads the whole file chunk by chunk and returns its SHA-256 as hex.
/// Fails if the file on disk is shorter than `file_size`.
pub async fn hash_file(path: &Path, file_size: u64) -> Result<String, StorageError> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE as usize];

    for index in 0..num_chunks(file_size) {
        let len = chunk_len(file_size, index)? as usize;
        file.read_exact(&mut buffer[..len]).await?;
        hasher.update(&buffer[..len]);
    }

    Ok(hex::encode(hasher.finalize()))
}
