// SPDX-FileCopyrightText: 2025 The swarmseed Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::io::{split, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tracing::{event, Level};

use super::framer::Framer;
use super::protocol::{Message, MessageSummary};
use super::transport::{PeerStream, Transport};
use crate::errors::SessionError;

const PEER_WRITE_QUEUE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionType {
    Outgoing,
    Incoming,
}

/// A decoded message together with the session it arrived on.
pub struct SessionEvent {
    pub session: Arc<Session>,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClosed {
    pub addr: String,
    pub id: u64,
}

struct DisconnectGuard {
    addr: String,
    id: u64,
    closed_tx: mpsc::UnboundedSender<SessionClosed>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let _ = self.closed_tx.send(SessionClosed {
            addr: self.addr.clone(),
            id: self.id,
        });
    }
}

struct AbortOnDrop(JoinHandle<()>);
impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// One live connection to a peer, shared by every file transferred with it.
pub struct Session {
    addr: String,
    id: u64,
    connection_type: ConnectionType,
    writer_tx: mpsc::Sender<Message>,
    last_activity: Mutex<Instant>,
    closing: Arc<Notify>,
    closed: AtomicBool,
}

impl Session {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    pub async fn send(&self, message: Message) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.addr.clone()));
        }
        self.writer_tx
            .send(message)
            .await
            .map_err(|_| SessionError::Closed(self.addr.clone()))
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Asks the reader loop to stop. The registry hears about it through the
    /// usual close notification.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.closing.notify_one();
    }

    /// True once the session was asked to close or its reader stopped.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct SessionRegistryParameters {
    pub transport: Arc<dyn Transport>,
    pub framer: Framer,
    pub events_tx: mpsc::Sender<SessionEvent>,
    pub closed_tx: mpsc::UnboundedSender<SessionClosed>,
    pub shutdown_tx: broadcast::Sender<()>,
}

/// At most one live session per peer address.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    transport: Arc<dyn Transport>,
    framer: Framer,
    events_tx: mpsc::Sender<SessionEvent>,
    closed_tx: mpsc::UnboundedSender<SessionClosed>,
    shutdown_tx: broadcast::Sender<()>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new(params: SessionRegistryParameters) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            transport: params.transport,
            framer: params.framer,
            events_tx: params.events_tx,
            closed_tx: params.closed_tx,
            shutdown_tx: params.shutdown_tx,
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns the live session for `addr`, dialing one if there is none.
    /// The dial happens outside the registry lock; if another task won the
    /// race the existing session is kept and the new stream dropped.
    pub async fn get_or_dial(
        &self,
        addr: &str,
        dial_timeout: Duration,
    ) -> Result<Arc<Session>, SessionError> {
        if let Some(session) = self.get(addr) {
            return Ok(session);
        }

        event!(Level::DEBUG, peer = addr, "Dialing peer");
        let stream = match timeout(dial_timeout, self.transport.dial(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(SessionError::Dial {
                    addr: addr.to_string(),
                    source,
                })
            }
            Err(_) => return Err(SessionError::DialTimeout(addr.to_string())),
        };

        Ok(self.register(addr, stream, ConnectionType::Outgoing))
    }

    /// Wraps an accepted connection. A peer that already has a live session
    /// keeps it and the new stream is dropped.
    pub fn accept_inbound(&self, stream: PeerStream, addr: &str) -> Arc<Session> {
        self.register(addr, stream, ConnectionType::Incoming)
    }

    pub fn is_existing(&self, addr: &str) -> bool {
        self.lock().contains_key(addr)
    }

    pub fn get(&self, addr: &str) -> Option<Arc<Session>> {
        self.lock().get(addr).cloned()
    }

    pub fn touch(&self, addr: &str) {
        if let Some(session) = self.get(addr) {
            session.touch();
        }
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Removes the entry only if it is still the session identified by `id`.
    pub fn remove_if_current(&self, addr: &str, id: u64) -> bool {
        let mut sessions = self.lock();
        match sessions.get(addr) {
            Some(session) if session.id == id => {
                sessions.remove(addr);
                true
            }
            _ => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(
        &self,
        addr: &str,
        stream: PeerStream,
        connection_type: ConnectionType,
    ) -> Arc<Session> {
        let mut sessions = self.lock();
        if let Some(existing) = sessions.get(addr) {
            event!(
                Level::DEBUG,
                peer = addr,
                ?connection_type,
                "Peer already has a live session, dropping new stream"
            );
            return existing.clone();
        }

        let session = self.spawn_session(addr, stream, connection_type);
        sessions.insert(addr.to_string(), session.clone());
        event!(
            Level::INFO,
            peer = addr,
            ?connection_type,
            session_id = session.id,
            "Session established"
        );
        session
    }

    fn spawn_session(
        &self,
        addr: &str,
        stream: PeerStream,
        connection_type: ConnectionType,
    ) -> Arc<Session> {
        let (read_half, write_half) = split(stream);
        let (writer_tx, writer_rx) = mpsc::channel::<Message>(PEER_WRITE_QUEUE);
        let closing = Arc::new(Notify::new());

        let session = Arc::new(Session {
            addr: addr.to_string(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            connection_type,
            writer_tx,
            last_activity: Mutex::new(Instant::now()),
            closing: closing.clone(),
            closed: AtomicBool::new(false),
        });

        let writer_handle = tokio::spawn(writer_task(
            write_half,
            writer_rx,
            self.framer.clone(),
            closing,
            self.shutdown_tx.subscribe(),
        ));

        let guard = DisconnectGuard {
            addr: session.addr.clone(),
            id: session.id,
            closed_tx: self.closed_tx.clone(),
        };
        tokio::spawn(reader_loop(
            session.clone(),
            read_half,
            self.framer.clone(),
            self.events_tx.clone(),
            guard,
            AbortOnDrop(writer_handle),
            self.shutdown_tx.subscribe(),
        ));

        session
    }
}

pub async fn writer_task<W>(
    mut stream_write_half: W,
    mut write_rx: mpsc::Receiver<Message>,
    framer: Framer,
    closing: Arc<Notify>,
    mut shutdown_rx: broadcast::Receiver<()>,
) where
    W: AsyncWriteExt + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            Some(message) = write_rx.recv() => {
                tokio::select! {
                    write_result = framer.write_message(&mut stream_write_half, message) => {
                        if let Err(e) = write_result {
                            event!(Level::DEBUG, "Session write failed: {}", e);
                            closing.notify_one();
                            break;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        event!(Level::TRACE, "Writer task shutting down during write.");
                        break;
                    }
                }
            }

            _ = shutdown_rx.recv() => {
                event!(Level::TRACE, "Writer task shutting down while idle.");
                break;
            }

            else => {
                event!(Level::TRACE, "Writer task shutting down, channel closed.");
                break;
            }
        }
    }
}

async fn reader_loop<R>(
    session: Arc<Session>,
    mut stream_read_half: R,
    framer: Framer,
    events_tx: mpsc::Sender<SessionEvent>,
    _disconnect_guard: DisconnectGuard,
    _writer_abort_guard: AbortOnDrop,
    mut shutdown_rx: broadcast::Receiver<()>,
) where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            read = framer.read_message(&mut stream_read_half) => match read {
                Ok(Ok(message)) => {
                    session.touch();
                    event!(Level::TRACE, peer = %session.addr, message = ?MessageSummary(&message));
                    let event = SessionEvent { session: session.clone(), message };
                    if events_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    session.touch();
                    event!(Level::DEBUG, peer = %session.addr, "Dropped message: {}", e);
                }
                Err(e) => {
                    event!(Level::DEBUG, peer = %session.addr, "Session read ended: {}", e);
                    break;
                }
            },

            _ = session.closing.notified() => {
                event!(Level::DEBUG, peer = %session.addr, "Session closed locally");
                break;
            }

            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }
    session.closed.store(true, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandwidth::BandwidthTracker;
    use crate::networking::protocol::read_frame;
    use crate::networking::transport::memory::{BlackholeTransport, MemoryNetwork};

    struct Harness {
        registry: Arc<SessionRegistry>,
        events_rx: mpsc::Receiver<SessionEvent>,
        closed_rx: mpsc::UnboundedReceiver<SessionClosed>,
        _shutdown_tx: broadcast::Sender<()>,
    }

    fn harness(transport: Arc<dyn Transport>) -> Harness {
        let (events_tx, events_rx) = mpsc::channel(16);
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = Arc::new(SessionRegistry::new(SessionRegistryParameters {
            transport,
            framer: Framer::new(Arc::new(BandwidthTracker::new())),
            events_tx,
            closed_tx,
            shutdown_tx: shutdown_tx.clone(),
        }));
        Harness {
            registry,
            events_rx,
            closed_rx,
            _shutdown_tx: shutdown_tx,
        }
    }

    fn request(chunk_index: u64) -> Message {
        Message::ChunkRequest {
            file_id: "f".to_string(),
            chunk_index,
        }
    }

    #[tokio::test]
    async fn test_get_or_dial_reuses_live_session() {
        let net = MemoryNetwork::new();
        let mut listener = net.listen("b");
        let a = harness(Arc::new(net.transport_for("a")));

        let first = a
            .registry
            .get_or_dial("b", Duration::from_secs(1))
            .await
            .unwrap();
        let second = a
            .registry
            .get_or_dial("b", Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(first.connection_type(), ConnectionType::Outgoing);
        assert_eq!(a.registry.count(), 1);
        assert!(a.registry.is_existing("b"));

        let (_server, from) = listener.recv().await.unwrap();
        assert_eq!(from, "a");
        assert!(listener.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_messages_flow_between_registries() {
        let net = MemoryNetwork::new();
        let mut listener = net.listen("b");
        let a = harness(Arc::new(net.transport_for("a")));
        let mut b = harness(Arc::new(net.transport_for("b")));

        let to_b = a
            .registry
            .get_or_dial("b", Duration::from_secs(1))
            .await
            .unwrap();
        let (server, from) = listener.recv().await.unwrap();
        b.registry.accept_inbound(Box::new(server), &from);

        to_b.send(request(4)).await.unwrap();
        let event = timeout(Duration::from_secs(1), b.events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.session.addr(), "a");
        assert_eq!(event.session.connection_type(), ConnectionType::Incoming);
        assert_eq!(event.message, request(4));

        event.session.send(request(5)).await.unwrap();
        let mut a_events = a.events_rx;
        let reply = timeout(Duration::from_secs(1), a_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.session.id(), to_b.id());
        assert_eq!(reply.message, request(5));
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails_to_dial() {
        let net = MemoryNetwork::new();
        let a = harness(Arc::new(net.transport_for("a")));

        let result = a.registry.get_or_dial("nowhere", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SessionError::Dial { .. })));
        assert_eq!(a.registry.count(), 0);
    }

    #[tokio::test]
    async fn test_dial_times_out() {
        let a = harness(Arc::new(BlackholeTransport));
        let result = a
            .registry
            .get_or_dial("slow", Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(SessionError::DialTimeout(addr)) if addr == "slow"));
    }

    #[tokio::test]
    async fn test_peer_disconnect_reports_close() {
        let net = MemoryNetwork::new();
        let mut listener = net.listen("b");
        let mut a = harness(Arc::new(net.transport_for("a")));

        let session = a
            .registry
            .get_or_dial("b", Duration::from_secs(1))
            .await
            .unwrap();
        let (server, _) = listener.recv().await.unwrap();
        drop(server);

        let closed = timeout(Duration::from_secs(1), a.closed_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            closed,
            SessionClosed {
                addr: "b".to_string(),
                id: session.id()
            }
        );
        assert!(a.registry.remove_if_current("b", closed.id));
        assert!(!a.registry.remove_if_current("b", closed.id));
        assert_eq!(a.registry.count(), 0);
    }

    #[tokio::test]
    async fn test_local_close_ends_session_once() {
        let net = MemoryNetwork::new();
        let mut listener = net.listen("b");
        let mut a = harness(Arc::new(net.transport_for("a")));

        let session = a
            .registry
            .get_or_dial("b", Duration::from_secs(1))
            .await
            .unwrap();
        let (_server, _) = listener.recv().await.unwrap();

        session.close();
        session.close();

        let closed = timeout(Duration::from_secs(1), a.closed_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.id, session.id());
        assert!(timeout(Duration::from_millis(100), a.closed_rx.recv())
            .await
            .is_err());

        // The writer is gone along with the reader.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(session.send(request(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_inbound_duplicate_keeps_existing_session() {
        let a = harness(Arc::new(BlackholeTransport));
        let (first_stream, _first_peer) = tokio::io::duplex(1024);
        let (second_stream, mut second_peer) = tokio::io::duplex(1024);

        let first = a.registry.accept_inbound(Box::new(first_stream), "x");
        let second = a.registry.accept_inbound(Box::new(second_stream), "x");
        assert_eq!(first.id(), second.id());
        assert_eq!(a.registry.count(), 1);

        // The dropped stream reads as closed on the far side.
        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_secs(1), second_peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_touch_and_frames_on_the_wire() {
        let a = harness(Arc::new(BlackholeTransport));
        let (stream, mut peer) = tokio::io::duplex(1024);
        let session = a.registry.accept_inbound(Box::new(stream), "x");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(session.idle_for() >= Duration::from_millis(30));
        a.registry.touch("x");
        assert!(session.idle_for() < Duration::from_millis(30));

        session.send(request(9)).await.unwrap();
        let frame = timeout(Duration::from_secs(1), read_frame(&mut peer))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.msg_type, crate::networking::protocol::CHUNK_MESSAGE_TYPE);
    }

    #[tokio::test]
    async fn test_shutdown_ends_sessions() {
        let a = harness(Arc::new(BlackholeTransport));
        let mut closed_rx = a.closed_rx;
        let (stream, _peer) = tokio::io::duplex(1024);
        a.registry.accept_inbound(Box::new(stream), "x");

        a._shutdown_tx.send(()).unwrap();
        let closed = timeout(Duration::from_secs(1), closed_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.addr, "x");
    }
}
