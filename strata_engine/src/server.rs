//! Engine server: session acceptance, packet routing, transport upgrade.
//!
//! The server exposes one HTTP entry point, [`Server::handle`], typically
//! mounted at `/engine.io/`:
//!
//! | Query        | Meaning                                                  |
//! |--------------|----------------------------------------------------------|
//! | `EIO`        | Protocol major version; mismatch is rejected with 400    |
//! | `transport`  | `polling` or `websocket`; anything else is 400           |
//! | `sid`        | Session id; absent ⇒ new session, unknown ⇒ 400          |
//! | `j`          | JSONP callback token (polling GET encoding)              |
//! | `b64`        | `1` forces the text framing on polling GET responses     |
//!
//! A request without a `sid` opens a session: the transport is accepted, an
//! OPEN packet carrying the handshake parameters is queued, a read loop is
//! spawned, and the socket surfaces through [`Server::accept`]. A request
//! whose `sid` names a live session is delegated to that session's polling
//! connection - unless the transport name differs, which starts the upgrade
//! dance (§ below).
//!
//! # Upgrade
//!
//! Upgrading a session from transport T0 to T1 without losing or reordering
//! packets:
//!
//! 1. pause the session barrier (outbound worker and read loop hold),
//! 2. probe on T1: expect PING, answer PONG on T1,
//! 3. pause T0 (its pending poll is released with a NOOP),
//! 4. expect UPGRADE on T1; on failure close T1 and resume T0,
//! 5. close T0, replay its drained out-queue onto T1 in order,
//! 6. swap the session's transport slot under the write lock,
//! 7. re-dispatch T0's drained in-queue as if received on T1,
//! 8. fire the upgrade event and resume the barrier.

use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{body::Incoming, header, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::{net::TcpListener, task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;
use tungstenite::handshake::derive_accept_key;

use crate::{
    error::EngineError,
    packet::{MessageKind, Packet, PacketKind, Parameters},
    session::SessionManager,
    socket::{Event, Socket, DEFAULT_OUTBOX},
    transport::{
        polling::{self, PollingConn},
        websocket, Conn, TRANSPORT_POLLING, TRANSPORT_WEBSOCKET,
    },
};

/// Engine protocol major version spoken by this server.
pub const PROTOCOL_VERSION: &str = "3";

/// Capacity of the queue of newly opened sessions awaiting
/// [`Server::accept`].
const ACCEPT_BUFFER: usize = 8;

/// Server tunables.
#[derive(Debug, Clone)]
pub struct Options {
    /// Interval between client keep-alive pings.
    pub ping_interval: Duration,
    /// Grace period for a ping answer; also the per-packet write budget.
    pub ping_timeout: Duration,
    /// Capacity of each session's outbound queue.
    pub outbox_capacity: usize,
    /// Capacity of each polling connection's `in`/`out` queues.
    pub polling_buffer: usize,
}

impl Options {
    /// Set the ping interval.
    #[must_use]
    pub const fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the ping timeout.
    #[must_use]
    pub const fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Set the outbound queue capacity.
    #[must_use]
    pub const fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity;
        self
    }

    /// Set the polling queue capacity.
    #[must_use]
    pub const fn with_polling_buffer(mut self, buffer: usize) -> Self {
        self.polling_buffer = buffer;
        self
    }

    /// Read deadline derived from the keep-alive settings.
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        // A live client pings every `ping_interval`; silence longer than
        // interval + timeout means it is gone.
        Duration::from_millis(
            self.ping_interval.as_millis() as u64 + self.ping_timeout.as_millis() as u64,
        )
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(25_000),
            ping_timeout: Duration::from_millis(5_000),
            outbox_capacity: DEFAULT_OUTBOX,
            polling_buffer: polling::DEFAULT_BUFFER,
        }
    }
}

/// Engine server.
///
/// Cheap to clone; clones share the session registry and accept queue.
#[derive(Debug, Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    options: Options,
    sessions: SessionManager,
    accepted_tx: async_channel::Sender<Arc<Socket>>,
    accepted_rx: async_channel::Receiver<Arc<Socket>>,
    cancel: CancellationToken,
}

impl Server {
    /// A new server with the given options.
    #[must_use]
    pub fn new(options: Options) -> Self {
        let (accepted_tx, accepted_rx) = async_channel::bounded(ACCEPT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                options,
                sessions: SessionManager::new(),
                accepted_tx,
                accepted_rx,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// The session registry.
    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    /// The configured options.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Wait for the next newly opened session.
    ///
    /// # Errors
    ///
    /// Fails with [`EngineError::Closed`] once the server shuts down.
    pub async fn accept(&self) -> Result<Arc<Socket>, EngineError> {
        self.inner
            .accepted_rx
            .recv()
            .await
            .map_err(|_| EngineError::Closed)
    }

    /// Shut down: close every session and release
    /// [`accept`](Server::accept) callers.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.accepted_rx.close();
        for socket in self.inner.sessions.drain().await {
            socket.close().await;
        }
    }

    /// Serve connections from a TCP listener until [`close`](Server::close).
    pub async fn serve(&self, listener: TcpListener) {
        let mut conns = JoinSet::new();
        loop {
            tokio::select! {
                () = self.inner.cancel.cancelled() => break,
                res = listener.accept() => match res {
                    Ok((stream, addr)) => {
                        let server = self.clone();
                        conns.spawn(async move { server.serve_connection(stream, addr).await });
                    }
                    Err(e) => tracing::error!("accept error: {e}"),
                },
            }
        }
        while conns.join_next().await.is_some() {}
    }

    async fn serve_connection(self, stream: tokio::net::TcpStream, addr: SocketAddr) {
        let io = TokioIo::new(stream);
        let server = self.clone();
        let service = hyper::service::service_fn(move |req| {
            let server = server.clone();
            async move { Ok::<_, Infallible>(server.handle(req).await) }
        });
        let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
        if let Err(e) = builder.serve_connection_with_upgrades(io, service).await {
            tracing::debug!("HTTP connection from {addr} ended: {e}");
        }
    }

    /// Route one HTTP request.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let query = Query::parse(req.uri().query().unwrap_or_default());
        tracing::debug!(
            method = %req.method(),
            transport = %query.transport,
            sid = query.sid.as_deref().unwrap_or("-"),
            "engine request"
        );

        if query.eio != PROTOCOL_VERSION {
            return plain(StatusCode::BAD_REQUEST, "protocol version incompatible");
        }
        match query.transport.as_str() {
            TRANSPORT_POLLING => self.handle_polling(req, query).await,
            TRANSPORT_WEBSOCKET => self.handle_websocket(req, query).await,
            _ => plain(StatusCode::BAD_REQUEST, "invalid transport"),
        }
    }

    async fn handle_polling(&self, req: Request<Incoming>, query: Query) -> Response<Full<Bytes>> {
        match &query.sid {
            None => {
                let conn = Arc::new(PollingConn::new(self.inner.options.polling_buffer));
                let Some(_socket) = self.open_session(conn.clone(), TRANSPORT_POLLING).await
                else {
                    return plain(StatusCode::SERVICE_UNAVAILABLE, "server closed");
                };
                conn.handle(req, query.jsonp, query.b64, &self.inner.cancel)
                    .await
            }
            Some(sid) => {
                let Some(socket) = self.inner.sessions.get(sid).await else {
                    return plain(StatusCode::BAD_REQUEST, "invalid session");
                };
                let conn = socket.current_conn().await;
                match conn.as_polling() {
                    Some(polling) => {
                        polling
                            .handle(req, query.jsonp, query.b64, &self.inner.cancel)
                            .await
                    }
                    // The session already upgraded away from polling.
                    None => plain(StatusCode::BAD_REQUEST, "invalid transport"),
                }
            }
        }
    }

    async fn handle_websocket(
        &self,
        mut req: Request<Incoming>,
        query: Query,
    ) -> Response<Full<Bytes>> {
        // Pre-validate the session before committing to the upgrade.
        let existing = match &query.sid {
            None => None,
            Some(sid) => match self.inner.sessions.get(sid).await {
                Some(socket) => {
                    if socket.transport().await == TRANSPORT_WEBSOCKET {
                        return plain(StatusCode::BAD_REQUEST, "invalid transport");
                    }
                    Some(socket)
                }
                None => return plain(StatusCode::BAD_REQUEST, "invalid session"),
            },
        };

        let upgrade_requested = req
            .headers()
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        if !upgrade_requested {
            return plain(StatusCode::BAD_REQUEST, "not a websocket upgrade");
        }
        let Some(key) = req.headers().get(header::SEC_WEBSOCKET_KEY) else {
            return plain(StatusCode::BAD_REQUEST, "missing websocket key");
        };
        let accept_key = derive_accept_key(key.as_bytes());

        let on_upgrade = hyper::upgrade::on(&mut req);
        let server = self.clone();
        tokio::spawn(async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    tracing::debug!("websocket upgrade failed: {e}");
                    return;
                }
            };
            let conn: Arc<dyn Conn> = Arc::new(websocket::accept(upgraded).await);
            match existing {
                None => {
                    let _ = server.open_session(conn, TRANSPORT_WEBSOCKET).await;
                }
                Some(socket) => server.upgrade(socket, conn).await,
            }
        });

        #[allow(clippy::expect_used)]
        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_ACCEPT, accept_key)
            .body(Full::new(Bytes::new()))
            .expect("static response")
    }

    /// Register a session on `conn`, queue the OPEN handshake, start its
    /// read loop, and surface it through [`accept`](Server::accept).
    ///
    /// Returns `None` when the server is shutting down.
    async fn open_session(
        &self,
        conn: Arc<dyn Conn>,
        transport: &'static str,
    ) -> Option<Arc<Socket>> {
        if self.inner.cancel.is_cancelled() {
            return None;
        }
        let options = &self.inner.options;
        let socket = self
            .inner
            .sessions
            .create(
                conn,
                transport,
                options.read_timeout(),
                options.ping_timeout,
                options.outbox_capacity,
            )
            .await;

        let params = Parameters {
            sid: socket.sid().to_owned(),
            upgrades: vec![TRANSPORT_WEBSOCKET.to_owned()],
            ping_interval: options.ping_interval.as_millis() as u64,
            ping_timeout: options.ping_timeout.as_millis() as u64,
        };
        let body = serde_json::to_vec(&params).unwrap_or_default();
        if let Err(e) = socket.emit(PacketKind::Open, MessageKind::Text, body).await {
            tracing::warn!(sid = %socket.sid(), "handshake emit: {e}");
        }
        tracing::info!(sid = %socket.sid(), transport, "session opened");

        self.spawn_read_loop(socket.clone());

        tokio::select! {
            () = self.inner.cancel.cancelled() => {
                socket.close().await;
                self.inner.sessions.remove(socket.sid()).await;
                None
            }
            sent = self.inner.accepted_tx.send(socket.clone()) => match sent {
                Ok(()) => Some(socket),
                Err(_) => None,
            },
        }
    }

    fn spawn_read_loop(&self, socket: Arc<Socket>) {
        let server = self.clone();
        tokio::spawn(async move {
            loop {
                if server.inner.cancel.is_cancelled() || socket.is_closed() {
                    break;
                }
                match socket.read().await {
                    Ok(packet) => {
                        if !server.handle_packet(&socket, packet).await {
                            break;
                        }
                    }
                    Err(EngineError::Paused) => socket.wait_unpaused().await,
                    Err(e) => {
                        tracing::debug!(sid = %socket.sid(), "read: {e}");
                        socket.fire(Event::Close).await;
                        break;
                    }
                }
            }
            socket.close().await;
            server.inner.sessions.remove(socket.sid()).await;
            tracing::info!(sid = %socket.sid(), "session closed");
        });
    }

    /// Apply one received packet to the session state machine. Returns
    /// `false` when the session should stop reading.
    async fn handle_packet(&self, socket: &Arc<Socket>, packet: Packet) -> bool {
        match packet.packet_kind {
            PacketKind::Close => {
                socket.fire(Event::Close).await;
                false
            }
            PacketKind::Ping => {
                if let Err(e) = socket
                    .emit(PacketKind::Pong, packet.message_kind, packet.data.clone())
                    .await
                {
                    tracing::debug!(sid = %socket.sid(), "pong: {e}");
                }
                socket.fire(Event::Ping(packet.data)).await;
                true
            }
            PacketKind::Pong => {
                socket.fire(Event::Pong(packet.data)).await;
                true
            }
            PacketKind::Message => {
                socket
                    .fire(Event::Message(packet.message_kind, packet.data))
                    .await;
                true
            }
            PacketKind::Open | PacketKind::Upgrade | PacketKind::Noop => true,
        }
    }

    async fn upgrade(&self, socket: Arc<Socket>, new_conn: Arc<dyn Conn>) {
        tracing::debug!(sid = %socket.sid(), to = new_conn.name(), "upgrade start");
        socket.pause();
        let upgraded = self.try_upgrade(&socket, new_conn).await;
        socket.resume();
        match upgraded {
            Ok(()) => tracing::info!(sid = %socket.sid(), "upgrade complete"),
            Err(e) => tracing::debug!(sid = %socket.sid(), "upgrade aborted: {e}"),
        }
    }

    async fn try_upgrade(
        &self,
        socket: &Arc<Socket>,
        new_conn: Arc<dyn Conn>,
    ) -> Result<(), EngineError> {
        let read_timeout = self.inner.options.read_timeout();
        let write_timeout = self.inner.options.ping_timeout;
        let name = new_conn.name();

        // Probe: the peer opens with PING on the new transport.
        let _ = new_conn.set_read_deadline(Instant::now() + read_timeout);
        let probe = match new_conn.read_packet().await {
            Ok(packet) => packet,
            Err(e) => {
                let _ = new_conn.close().await;
                return Err(e);
            }
        };
        if probe.packet_kind != PacketKind::Ping {
            let _ = new_conn.close().await;
            return Err(EngineError::UnexpectedPacket);
        }
        let _ = new_conn.set_write_deadline(Instant::now() + write_timeout);
        let answer = Packet {
            message_kind: probe.message_kind,
            packet_kind: PacketKind::Pong,
            data: probe.data,
        };
        if let Err(e) = new_conn.write_packet(answer).await {
            let _ = new_conn.close().await;
            return Err(e);
        }

        // Gate the old transport. Its pending poll cycle resolves to NOOP.
        let old_conn = socket.current_conn().await;
        match old_conn.pause() {
            Ok(()) | Err(EngineError::PauseNotSupported) => {}
            Err(e) => {
                let _ = new_conn.close().await;
                return Err(e);
            }
        }

        // Confirmation: nothing is sent on the new transport before UPGRADE.
        let _ = new_conn.set_read_deadline(Instant::now() + read_timeout);
        let confirm = match new_conn.read_packet().await {
            Ok(packet) => packet,
            Err(e) => {
                let _ = new_conn.close().await;
                old_conn.resume();
                return Err(e);
            }
        };
        if confirm.packet_kind != PacketKind::Upgrade {
            let _ = new_conn.close().await;
            old_conn.resume();
            return Err(EngineError::UnexpectedPacket);
        }

        // Cut over: close the old transport, replay its undelivered
        // outbound packets in order, swap the slot, then re-dispatch
        // whatever it had received but not yet surfaced.
        let _ = old_conn.close().await;
        for packet in old_conn.flush_out() {
            let _ = new_conn.set_write_deadline(Instant::now() + write_timeout);
            if let Err(e) = new_conn.write_packet(packet).await {
                tracing::warn!(sid = %socket.sid(), "upgrade replay: {e}");
            }
        }
        socket.swap_transport(new_conn, name).await;
        for packet in old_conn.flush_in() {
            self.handle_packet(socket, packet).await;
        }

        socket.fire(Event::Upgrade).await;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Query {
    eio: String,
    transport: String,
    sid: Option<String>,
    jsonp: Option<String>,
    b64: bool,
}

impl Query {
    fn parse(raw: &str) -> Self {
        let mut query = Self::default();
        for pair in raw.split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "EIO" => query.eio = value.to_owned(),
                "transport" => query.transport = value.to_owned(),
                "sid" if !value.is_empty() => query.sid = Some(value.to_owned()),
                "j" if !value.is_empty() => query.jsonp = Some(value.to_owned()),
                "b64" => query.b64 = value == "1",
                _ => {}
            }
        }
        query
    }
}

#[allow(clippy::expect_used)]
fn plain(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(message.to_owned())))
        .expect("static response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parsing() {
        let query = Query::parse("EIO=3&transport=polling&sid=ABC&j=4&b64=1");
        assert_eq!(query.eio, "3");
        assert_eq!(query.transport, "polling");
        assert_eq!(query.sid.as_deref(), Some("ABC"));
        assert_eq!(query.jsonp.as_deref(), Some("4"));
        assert!(query.b64);

        let query = Query::parse("EIO=3&transport=websocket");
        assert_eq!(query.sid, None);
        assert_eq!(query.jsonp, None);
        assert!(!query.b64);
    }

    #[test]
    fn read_timeout_sums_keepalive_budgets() {
        let options = Options::default();
        assert_eq!(options.read_timeout(), Duration::from_millis(30_000));
    }
}
