// SPDX-FileCopyrightText: 2025 The swarmseed Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod framer;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-export key types for easier access.
pub use protocol::Message;
pub use session::{ConnectionType, Session};
