// SPDX-FileCopyrightText: 2025 The swarmseed Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{event, Level};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications for whatever sits in front of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EngineEvent {
    DownloadStarted { file_hash: String, file_name: String },
    DownloadFinished { file_hash: String, file_name: String },
    Error { label: String, message: String },
    PeerCount(usize),
}

/// Fire-and-forget broadcaster. Sending never waits and never fails, even
/// with nobody listening.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for Notifier {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn send(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn error(&self, label: &str, message: impl ToString) {
        let message = message.to_string();
        event!(Level::WARN, label, "{}", message);
        self.send(EngineEvent::Error {
            label: label.to_string(),
            message,
        });
    }
}
