// SPDX-FileCopyrightText: 2025 The swarmseed Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::io;

use thiserror::Error;

use crate::catalog::FileState;

/// Failures while moving frames over a stream. Always fatal to the session.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("declared frame length {len} exceeds the {max} byte limit")]
    Oversized { len: u32, max: u32 },

    #[error("payload of {0} bytes does not fit in a frame")]
    PayloadTooLarge(usize),

    #[error("message could not be encoded: {0}")]
    Encode(#[source] ProtocolError),
}

/// A frame arrived intact but its payload could not be understood.
/// The message is dropped and the session stays up.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),

    #[error("chunk payload could not be decoded: {0}")]
    Decode(#[from] serde_bencode::Error),

    #[error("chunk {chunk} of {file_hash} is out of range")]
    ChunkOutOfRange { file_hash: String, chunk: u64 },

    #[error("chunk {chunk} of {file_hash} carried {actual} bytes, expected {expected}")]
    ChunkLength {
        file_hash: String,
        chunk: u64,
        expected: u64,
        actual: u64,
    },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("dialing {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("dialing {0} timed out")]
    DialTimeout(String),

    #[error("session to {0} is closed")]
    Closed(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("chunk {index} is out of range for a file of {num_chunks} chunks")]
    ChunkOutOfRange { index: u64, num_chunks: u64 },

    #[error("chunk {index} expects {expected} bytes but got {actual}")]
    ChunkLength {
        index: u64,
        expected: u64,
        actual: u64,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0:?} is not a valid file hash")]
    InvalidKey(String),

    #[error("record store I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("record could not be serialized: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("record {path} could not be parsed: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("file {0} is not in the catalog")]
    NotFound(String),

    #[error("file {0} is already in the catalog")]
    AlreadyExists(String),

    #[error("file {file_hash} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        file_hash: String,
        from: FileState,
        to: FileState,
    },

    #[error("chunk {index} is out of range for {file_hash}")]
    ChunkOutOfRange { file_hash: String, index: u64 },

    #[error("file {file_hash} is {state:?}, not downloading")]
    NotDownloading { file_hash: String, state: FileState },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("insufficient balance to cover a fee of {fee}")]
    InsufficientBalance { fee: u64 },

    #[error("payment backend failed: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("file {0} is not in the remote listing")]
    NotListed(String),

    #[error("path {0} is already being seeded")]
    AlreadySeeded(String),

    #[error("file {0} is already downloading")]
    AlreadyDownloading(String),

    #[error("{0:?} is not a valid file hash")]
    InvalidFileHash(String),

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Payment(#[from] PaymentError),
}
