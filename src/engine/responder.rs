// SPDX-FileCopyrightText: 2025 The swarmseed Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::Arc;

use tracing::{event, Level};

use super::Shared;
use crate::catalog::{ChunkMark, FileState};
use crate::errors::{ProtocolError, StorageError};
use crate::networking::protocol::Message;
use crate::networking::session::{Session, SessionEvent};
use crate::storage;

/// Handles one inbound chunk message. Runs as its own task.
pub(crate) async fn handle_event(shared: Arc<Shared>, event: SessionEvent) {
    let SessionEvent { session, message } = event;
    match message {
        Message::ChunkRequest {
            file_id,
            chunk_index,
        } => serve_request(&shared, &session, file_id, chunk_index).await,
        Message::ChunkDelivery {
            file_id,
            chunk_index,
            data,
        } => ingest_delivery(&shared, &session, file_id, chunk_index, data).await,
    }
}

/// Reads the chunk from the local copy and sends it back on the same
/// session. Anything that goes wrong drops the request; the requester's
/// timeout takes care of retrying elsewhere.
async fn serve_request(shared: &Shared, session: &Session, file_id: String, chunk_index: u64) {
    let Some(record) = shared.catalog.get(&file_id) else {
        event!(Level::DEBUG, peer = %session.addr(), file_hash = %file_id, "Request for unknown file");
        return;
    };
    if !record.chunk_map.is_set(chunk_index) {
        event!(Level::DEBUG, peer = %session.addr(), file_hash = %file_id, chunk = chunk_index, "Request for chunk we do not hold");
        return;
    }

    let data = match storage::read_chunk(&record.local_path, record.file_size, chunk_index).await {
        Ok(data) => data,
        Err(e) => {
            event!(Level::WARN, file_hash = %file_id, chunk = chunk_index, "Failed to read chunk: {}", e);
            return;
        }
    };

    let delivery = Message::ChunkDelivery {
        file_id,
        chunk_index,
        data,
    };
    if let Err(e) = session.send(delivery).await {
        event!(Level::DEBUG, peer = %session.addr(), "Could not reply with chunk: {}", e);
    }
}

/// Writes a delivered chunk into the backing file and records it as present.
async fn ingest_delivery(
    shared: &Shared,
    session: &Session,
    file_id: String,
    chunk_index: u64,
    data: Vec<u8>,
) {
    let owned = shared
        .transfers
        .begin_landing(&file_id, chunk_index, session.addr());

    let landed = land_chunk(shared, session, &file_id, chunk_index, &data).await;

    if owned {
        shared.transfers.finish_landing(&file_id, chunk_index);
    }
    if landed {
        shared.progress.notify_waiters();
    }
}

async fn land_chunk(
    shared: &Shared,
    session: &Session,
    file_id: &str,
    chunk_index: u64,
    data: &[u8],
) -> bool {
    let Some(record) = shared.catalog.get(file_id) else {
        event!(Level::DEBUG, peer = %session.addr(), file_hash = file_id, "Delivery for unknown file");
        return false;
    };

    let expected = match storage::chunk_len(record.file_size, chunk_index) {
        Ok(expected) => expected,
        Err(_) => {
            let e = ProtocolError::ChunkOutOfRange {
                file_hash: file_id.to_string(),
                chunk: chunk_index,
            };
            event!(Level::WARN, peer = %session.addr(), "Dropping delivery: {}", e);
            return false;
        }
    };
    if data.len() as u64 != expected {
        let e = ProtocolError::ChunkLength {
            file_hash: file_id.to_string(),
            chunk: chunk_index,
            expected,
            actual: data.len() as u64,
        };
        event!(Level::WARN, peer = %session.addr(), "Dropping delivery: {}", e);
        return false;
    }

    if record.chunk_map.is_set(chunk_index) {
        event!(Level::DEBUG, file_hash = file_id, chunk = chunk_index, "Duplicate delivery ignored");
        return false;
    }
    if record.state != FileState::Downloading {
        event!(Level::DEBUG, file_hash = file_id, state = ?record.state, "Delivery for a file that is not downloading");
        return false;
    }

    let write: Result<(), StorageError> =
        storage::write_chunk(&record.local_path, record.file_size, chunk_index, data).await;
    if let Err(e) = write {
        event!(Level::WARN, file_hash = file_id, chunk = chunk_index, "Failed to write chunk: {}", e);
        return false;
    }

    match shared.catalog.mark_chunk_present(file_id, chunk_index).await {
        Ok(ChunkMark::Completed(record)) => {
            shared.finish_download(&record);
            true
        }
        Ok(ChunkMark::Stored) => {
            event!(Level::TRACE, file_hash = file_id, chunk = chunk_index, peer = %session.addr(), "Chunk stored");
            true
        }
        Ok(ChunkMark::AlreadyPresent) => false,
        Err(e) => {
            event!(Level::WARN, file_hash = file_id, chunk = chunk_index, "Failed to record chunk: {}", e);
            false
        }
    }
}
