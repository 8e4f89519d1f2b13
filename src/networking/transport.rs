// SPDX-FileCopyrightText: 2025 The swarmseed Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Any ordered, reliable byte stream to a peer.
pub trait PeerIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T> PeerIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type PeerStream = Box<dyn PeerIo>;

/// Outbound half of the overlay. Inbound streams are handed to the session
/// registry by whoever owns the listener.
pub trait Transport: Send + Sync + 'static {
    fn dial<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, io::Result<PeerStream>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    fn dial<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, io::Result<PeerStream>> {
        Box::pin(async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as PeerStream)
        })
    }
}
