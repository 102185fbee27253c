//! Per-session engine socket.
//!
//! A [`Socket`] owns the session's current transport and everything that
//! must survive a transport swap: the outbound queue and its single drain
//! worker, the pause barrier, the keep-alive timeouts, and the event
//! channel consumed by the layer above.
//!
//! ```text
//! emit()/send() ──► outbox ──► worker: barrier.wait → write deadline → conn
//! read loop (server/client) ──► read(): read deadline → conn ──► events
//! ```
//!
//! The transport slot is rewritten only under its write lock and only while
//! the barrier is paused; readers clone the `Arc` out of the slot and never
//! hold the lock across I/O.

use std::{sync::Arc, time::Duration};

use async_lock::RwLock;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    barrier::Barrier,
    error::EngineError,
    packet::{MessageKind, Packet, PacketKind},
    transport::Conn,
};

/// Default capacity of the outbound queue.
pub const DEFAULT_OUTBOX: usize = 8;

/// Capacity of the per-socket event channel.
const EVENT_BUFFER: usize = 64;

/// Events fanned out to the socket's consumer, in receive order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A MESSAGE packet arrived; payload belongs to the application layer.
    Message(MessageKind, Vec<u8>),
    /// A PING arrived (server side; the PONG answer is already queued).
    Ping(Vec<u8>),
    /// A PONG arrived (client side liveness).
    Pong(Vec<u8>),
    /// A transport upgrade completed.
    Upgrade,
    /// The session is gone: CLOSE received, transport failed, or closed
    /// locally.
    Close,
}

#[derive(Debug)]
struct Current {
    conn: Arc<dyn Conn>,
    transport: &'static str,
}

/// A live engine session.
#[derive(Debug)]
pub struct Socket {
    sid: String,
    current: RwLock<Current>,
    read_timeout: Duration,
    write_timeout: Duration,
    barrier: Barrier,
    outbox: async_channel::Sender<Packet>,
    events_tx: async_channel::Sender<Event>,
    events_rx: async_channel::Receiver<Event>,
    cancel: CancellationToken,
    worker: async_lock::Mutex<Option<JoinHandle<()>>>,
}

impl Socket {
    pub(crate) fn new(
        conn: Arc<dyn Conn>,
        transport: &'static str,
        sid: String,
        read_timeout: Duration,
        write_timeout: Duration,
        outbox_capacity: usize,
    ) -> Arc<Self> {
        let (outbox, outbox_rx) = async_channel::bounded(outbox_capacity);
        let (events_tx, events_rx) = async_channel::bounded(EVENT_BUFFER);

        let socket = Arc::new(Self {
            sid,
            current: RwLock::new(Current { conn, transport }),
            read_timeout,
            write_timeout,
            barrier: Barrier::new(),
            outbox,
            events_tx,
            events_rx,
            cancel: CancellationToken::new(),
            worker: async_lock::Mutex::new(None),
        });

        let handle = tokio::spawn(Self::drain_outbox(socket.clone(), outbox_rx));
        // The socket was just created; nothing contends for the slot yet.
        if let Some(mut worker) = socket.worker.try_lock() {
            *worker = Some(handle);
        }
        socket
    }

    /// Session id.
    #[must_use]
    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Name of the transport currently carrying the session.
    pub async fn transport(&self) -> &'static str {
        self.current.read().await.transport
    }

    /// The socket's event stream. Events are delivered in receive order;
    /// a consumer that stops reading eventually backpressures the session's
    /// read loop.
    #[must_use]
    pub fn events(&self) -> async_channel::Receiver<Event> {
        self.events_rx.clone()
    }

    /// Whether [`close`](Socket::close) ran or the session was torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) async fn current_conn(&self) -> Arc<dyn Conn> {
        self.current.read().await.conn.clone()
    }

    /// Install a new transport. Callers must hold the session paused; see
    /// the upgrade flow in the server.
    pub(crate) async fn swap_transport(&self, conn: Arc<dyn Conn>, transport: &'static str) {
        let mut current = self.current.write().await;
        current.conn = conn;
        current.transport = transport;
    }

    pub(crate) fn pause(&self) {
        self.barrier.pause();
    }

    pub(crate) fn resume(&self) {
        self.barrier.resume();
    }

    /// Block while the session barrier is paused (upgrade in flight).
    pub async fn wait_unpaused(&self) {
        self.barrier.wait().await;
    }

    /// Read one packet from the current transport with the session's read
    /// deadline applied.
    ///
    /// # Errors
    ///
    /// [`EngineError::Paused`] is temporary: wait on the barrier and retry.
    /// Everything else is fatal to the session.
    pub async fn read(&self) -> Result<Packet, EngineError> {
        let conn = self.current_conn().await;
        conn.set_read_deadline(Instant::now() + self.read_timeout)?;
        conn.read_packet().await
    }

    /// Queue an engine packet for emission.
    ///
    /// Blocks while the outbox is full; this is the natural backpressure on
    /// emitters.
    ///
    /// # Errors
    ///
    /// Fails with [`EngineError::Closed`] once the session is closed.
    pub async fn submit(&self, packet: Packet) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Closed);
        }
        tokio::select! {
            () = self.cancel.cancelled() => Err(EngineError::Closed),
            sent = self.outbox.send(packet) => sent.map_err(|_| EngineError::SubmitClosed),
        }
    }

    /// Queue a packet of the given kind.
    ///
    /// # Errors
    ///
    /// Same conditions as [`submit`](Socket::submit).
    pub async fn emit(
        &self,
        packet_kind: PacketKind,
        message_kind: MessageKind,
        data: Vec<u8>,
    ) -> Result<(), EngineError> {
        self.submit(Packet {
            message_kind,
            packet_kind,
            data,
        })
        .await
    }

    /// Shorthand for emitting a text MESSAGE.
    ///
    /// # Errors
    ///
    /// Same conditions as [`submit`](Socket::submit).
    pub async fn send(&self, data: Vec<u8>) -> Result<(), EngineError> {
        self.emit(PacketKind::Message, MessageKind::Text, data).await
    }

    /// Shorthand for emitting a binary MESSAGE.
    ///
    /// # Errors
    ///
    /// Same conditions as [`submit`](Socket::submit).
    pub async fn send_binary(&self, data: Vec<u8>) -> Result<(), EngineError> {
        self.emit(PacketKind::Message, MessageKind::Binary, data)
            .await
    }

    pub(crate) async fn fire(&self, event: Event) {
        if self.events_tx.send(event).await.is_err() {
            tracing::debug!(sid = %self.sid, "event channel closed");
        }
    }

    /// Close the session: stop the outbound worker (draining what it can),
    /// close the transport, and wake the barrier. Idempotent.
    pub async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        // A paused barrier would wedge the draining worker.
        self.barrier.resume();

        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::debug!(sid = %self.sid, "outbound worker ended: {e}");
            }
        }

        let conn = self.current_conn().await;
        if let Err(e) = conn.close().await {
            tracing::debug!(sid = %self.sid, "transport close: {e}");
        }

        // Consumers drain any buffered events, then see the end of the
        // stream.
        self.events_tx.close();
    }

    /// Single-worker outbox drain: one packet at a time, in submission
    /// order, waiting out any upgrade pause before each write.
    async fn drain_outbox(self: Arc<Self>, rx: async_channel::Receiver<Packet>) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                packet = rx.recv() => match packet {
                    Ok(packet) => self.write_one(packet).await,
                    Err(_) => break,
                },
            }
        }
        // Final drain with the same discipline.
        while let Ok(packet) = rx.try_recv() {
            self.write_one(packet).await;
        }
    }

    async fn write_one(&self, packet: Packet) {
        self.barrier.wait().await;
        let conn = self.current_conn().await;
        if conn
            .set_write_deadline(Instant::now() + self.write_timeout)
            .is_err()
        {
            // Paused again between wait and write, or the conn died; the
            // packet is dropped with the connection.
            tracing::debug!(sid = %self.sid, kind = %packet.packet_kind, "write deadline refused");
            return;
        }
        if let Err(e) = conn.write_packet(packet).await {
            tracing::debug!(sid = %self.sid, "write: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::polling::{PollingConn, DEFAULT_BUFFER};
    use std::time::Duration;

    fn test_socket() -> (Arc<Socket>, Arc<PollingConn>) {
        let conn = Arc::new(PollingConn::new(DEFAULT_BUFFER));
        let socket = Socket::new(
            conn.clone(),
            "polling",
            "SID123".into(),
            Duration::from_secs(30),
            Duration::from_secs(5),
            DEFAULT_OUTBOX,
        );
        (socket, conn)
    }

    #[tokio::test]
    async fn emitted_packets_reach_the_transport_in_order() {
        let (socket, conn) = test_socket();
        for text in ["a", "b", "c"] {
            socket.send(text.into()).await.expect("send");
        }
        // The worker drains asynchronously; poll the out queue.
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), async {
            while seen.len() < 3 {
                for packet in conn.flush_out() {
                    seen.push(String::from_utf8(packet.data).expect("utf8"));
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("all packets emitted");
        assert_eq!(seen, vec!["a", "b", "c"]);
        socket.close().await;
    }

    #[tokio::test]
    async fn pause_holds_emission_until_resume() {
        let (socket, conn) = test_socket();
        socket.pause();
        socket.send(b"held".to_vec()).await.expect("send");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(conn.flush_out().is_empty(), "barrier must hold the worker");

        socket.resume();
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if !conn.flush_out().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("released after resume");
        socket.close().await;
    }

    #[tokio::test]
    async fn submit_after_close_fails() {
        let (socket, _conn) = test_socket();
        socket.close().await;
        assert!(matches!(
            socket.send(b"late".to_vec()).await,
            Err(EngineError::Closed)
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (socket, conn) = test_socket();
        socket.close().await;
        socket.close().await;
        assert!(socket.is_closed());
        assert!(matches!(
            conn.read_packet().await,
            Err(EngineError::Closed)
        ));
    }

    #[tokio::test]
    async fn swap_transport_changes_the_slot() {
        let (socket, _old) = test_socket();
        let replacement = Arc::new(PollingConn::new(DEFAULT_BUFFER));
        socket.pause();
        socket.swap_transport(replacement.clone(), "polling").await;
        socket.resume();

        socket.send(b"after".to_vec()).await.expect("send");
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if !replacement.flush_out().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("packet lands on the new transport");
        socket.close().await;
    }
}
