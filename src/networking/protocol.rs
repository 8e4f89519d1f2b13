// SPDX-FileCopyrightText: 2025 The swarmseed Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::EnumIter;
use tokio::io::AsyncReadExt;

use crate::errors::{FrameError, ProtocolError};

/// Type byte reserved for the chunk protocol.
pub const CHUNK_MESSAGE_TYPE: u8 = 0x01;

/// One type byte followed by a little-endian u32 payload length.
pub const FRAME_HEADER_LEN: usize = 5;

/// Anything longer is treated as a corrupted stream.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum MessageType {
    Chunk = CHUNK_MESSAGE_TYPE,
}
impl MessageType {
    pub fn id(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        MessageType::iter()
            .find(|t| t.id() == value)
            .ok_or(ProtocolError::UnknownType(value))
    }
}

/// The chunk protocol payload. A record without `data` asks for the chunk,
/// a record with `data` delivers it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChunkMessage {
    pub file_id: String,
    pub chunk_index: u64,
    #[serde(
        with = "serde_bytes",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Vec<u8>>,
}

/// A raw frame as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ChunkRequest {
        file_id: String,
        chunk_index: u64,
    },
    ChunkDelivery {
        file_id: String,
        chunk_index: u64,
        data: Vec<u8>,
    },
}

impl Message {
    pub fn file_id(&self) -> &str {
        match self {
            Message::ChunkRequest { file_id, .. } | Message::ChunkDelivery { file_id, .. } => {
                file_id
            }
        }
    }

    pub fn chunk_index(&self) -> u64 {
        match self {
            Message::ChunkRequest { chunk_index, .. }
            | Message::ChunkDelivery { chunk_index, .. } => *chunk_index,
        }
    }
}

impl From<ChunkMessage> for Message {
    fn from(record: ChunkMessage) -> Self {
        match record.data {
            Some(data) => Message::ChunkDelivery {
                file_id: record.file_id,
                chunk_index: record.chunk_index,
                data,
            },
            None => Message::ChunkRequest {
                file_id: record.file_id,
                chunk_index: record.chunk_index,
            },
        }
    }
}

impl From<Message> for ChunkMessage {
    fn from(message: Message) -> Self {
        match message {
            Message::ChunkRequest {
                file_id,
                chunk_index,
            } => ChunkMessage {
                file_id,
                chunk_index,
                data: None,
            },
            Message::ChunkDelivery {
                file_id,
                chunk_index,
                data,
            } => ChunkMessage {
                file_id,
                chunk_index,
                data: Some(data),
            },
        }
    }
}

pub struct MessageSummary<'a>(pub &'a Message);
impl fmt::Debug for MessageSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Message::ChunkRequest {
                file_id,
                chunk_index,
            } => write!(f, "REQUEST(file: {}, chunk: {})", file_id, chunk_index),
            Message::ChunkDelivery {
                file_id,
                chunk_index,
                data,
            } => write!(
                f,
                "DELIVERY(file: {}, chunk: {}, len: {})",
                file_id,
                chunk_index,
                data.len()
            ),
        }
    }
}

/// Encodes a message into its type byte and payload.
pub fn encode_message(message: Message) -> Result<(u8, Vec<u8>), ProtocolError> {
    let record = ChunkMessage::from(message);
    let payload = serde_bencode::to_bytes(&record)?;
    Ok((MessageType::Chunk.id(), payload))
}

pub fn decode_message(msg_type: u8, payload: &[u8]) -> Result<Message, ProtocolError> {
    match MessageType::try_from(msg_type)? {
        MessageType::Chunk => {
            let record: ChunkMessage = serde_bencode::from_bytes(payload)?;
            Ok(record.into())
        }
    }
}

pub fn generate_frame(msg_type: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len: u32 = payload
        .len()
        .try_into()
        .map_err(|_| FrameError::PayloadTooLarge(payload.len()))?;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.push(msg_type);
    frame.extend(len.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Reads exactly one frame. A short read or closed stream is an error.
pub async fn read_frame(socket: &mut (impl AsyncReadExt + Unpin)) -> Result<Frame, FrameError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    socket.read_exact(&mut header).await?;

    let msg_type = header[0];
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversized {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut payload = vec![0u8; len as usize];
    socket.read_exact(&mut payload).await?;

    Ok(Frame { msg_type, payload })
}
