// SPDX-FileCopyrightText: 2025 The swarmseed Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Peer-to-peer distribution of files split into fixed-size chunks.

pub mod announce;
pub mod bandwidth;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod errors;
pub mod networking;
pub mod status;
pub mod storage;

/// Every file is split into chunks of this many bytes; only the last chunk
/// may be shorter.
pub const CHUNK_SIZE: u64 = 1024 * 1024;
