// SPDX-FileCopyrightText: 2025 The swarmseed Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{event, Level};

use crate::bandwidth::BandwidthTracker;
use crate::errors::{FrameError, ProtocolError};
use crate::networking::protocol::{
    decode_message, encode_message, generate_frame, read_frame, Message, MessageSummary,
};

/// Moves whole messages over a stream and charges their payload bytes to the
/// file they belong to.
#[derive(Debug, Clone)]
pub struct Framer {
    bandwidth: Arc<BandwidthTracker>,
}

impl Framer {
    pub fn new(bandwidth: Arc<BandwidthTracker>) -> Self {
        Self { bandwidth }
    }

    pub async fn write_message<W>(&self, writer: &mut W, message: Message) -> Result<(), FrameError>
    where
        W: AsyncWriteExt + Unpin,
    {
        let file_id = message.file_id().to_string();
        let (msg_type, payload) = encode_message(message).map_err(FrameError::Encode)?;
        let frame = generate_frame(msg_type, &payload)?;

        writer.write_all(&frame).await?;
        self.bandwidth.record_upload(&file_id, payload.len() as u64);
        Ok(())
    }

    /// The outer error is fatal to the stream. The inner one only spoils this
    /// message; the stream is still aligned on the next frame.
    pub async fn read_message<R>(
        &self,
        reader: &mut R,
    ) -> Result<Result<Message, ProtocolError>, FrameError>
    where
        R: AsyncReadExt + Unpin,
    {
        let frame = read_frame(reader).await?;
        let payload_len = frame.payload.len() as u64;

        let decoded = decode_message(frame.msg_type, &frame.payload);
        match &decoded {
            Ok(message) => {
                self.bandwidth.record_download(message.file_id(), payload_len);
                event!(Level::TRACE, message = ?MessageSummary(message), "Frame read");
            }
            Err(e) => {
                event!(
                    Level::DEBUG,
                    msg_type = frame.msg_type,
                    len = payload_len,
                    "Dropping undecodable frame: {}",
                    e
                );
            }
        }
        Ok(decoded)
    }
}
