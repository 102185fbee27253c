//! Engine client: dial, handshake, keep-alive, read loop.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    error::EngineError,
    packet::{MessageKind, Packet, PacketKind, Parameters},
    server::PROTOCOL_VERSION,
    socket::{Event, Socket, DEFAULT_OUTBOX},
    transport::{websocket, Conn, TRANSPORT_WEBSOCKET},
};

/// An engine client session.
///
/// Dialing connects over websocket, expects the server's OPEN packet, and
/// then runs two background tasks: a keep-alive timer emitting PING every
/// `pingInterval`, and a read loop feeding the [event
/// stream](Client::events). Dropping the client does not close the session;
/// call [`close`](Client::close).
#[derive(Debug, Clone)]
pub struct Client {
    socket: Arc<Socket>,
    params: Parameters,
    cancel: CancellationToken,
}

impl Client {
    /// Dial an engine endpoint, e.g. `http://127.0.0.1:8080/engine.io/`.
    ///
    /// # Errors
    ///
    /// Fails when the websocket connection cannot be established, the first
    /// packet is not OPEN, or the handshake document does not parse.
    pub async fn dial(url: &str) -> Result<Self, EngineError> {
        let conn = Arc::new(websocket::dial(&dial_url(url)).await?);

        let first = conn.read_packet().await?;
        if first.packet_kind != PacketKind::Open {
            return Err(EngineError::UnexpectedPacket);
        }
        let params: Parameters = serde_json::from_slice(&first.data)
            .map_err(|e| EngineError::Handshake(e.to_string()))?;

        let ping_interval = Duration::from_millis(params.ping_interval);
        let ping_timeout = Duration::from_millis(params.ping_timeout);

        let socket = Socket::new(
            conn,
            TRANSPORT_WEBSOCKET,
            params.sid.clone(),
            ping_interval + ping_timeout,
            ping_timeout,
            DEFAULT_OUTBOX,
        );
        tracing::info!(sid = %socket.sid(), "dialed");

        let client = Self {
            socket,
            params,
            cancel: CancellationToken::new(),
        };
        client.spawn_ping_loop(ping_interval);
        client.spawn_read_loop();
        Ok(client)
    }

    /// Session id assigned by the server.
    #[must_use]
    pub fn sid(&self) -> &str {
        self.socket.sid()
    }

    /// Handshake parameters received from the server.
    #[must_use]
    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    /// The underlying session socket.
    #[must_use]
    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    /// The session's event stream.
    #[must_use]
    pub fn events(&self) -> async_channel::Receiver<Event> {
        self.socket.events()
    }

    /// Emit a text MESSAGE.
    ///
    /// # Errors
    ///
    /// Fails with [`EngineError::Closed`] once the session is closed.
    pub async fn send(&self, data: Vec<u8>) -> Result<(), EngineError> {
        self.socket.send(data).await
    }

    /// Emit a binary MESSAGE.
    ///
    /// # Errors
    ///
    /// Fails with [`EngineError::Closed`] once the session is closed.
    pub async fn send_binary(&self, data: Vec<u8>) -> Result<(), EngineError> {
        self.socket.send_binary(data).await
    }

    /// Close the session and stop the background tasks. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.socket.close().await;
    }

    fn spawn_ping_loop(&self, interval: Duration) {
        let socket = self.socket.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                if let Err(e) = socket
                    .emit(PacketKind::Ping, MessageKind::Text, Vec::new())
                    .await
                {
                    if !cancel.is_cancelled() {
                        tracing::debug!(sid = %socket.sid(), "ping: {e}");
                    }
                    break;
                }
            }
        });
    }

    fn spawn_read_loop(&self) {
        let socket = self.socket.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() || socket.is_closed() {
                    break;
                }
                match socket.read().await {
                    Ok(packet) => {
                        if !handle_packet(&socket, packet).await {
                            break;
                        }
                    }
                    Err(EngineError::Paused) => socket.wait_unpaused().await,
                    Err(e) => {
                        if !cancel.is_cancelled() {
                            tracing::debug!(sid = %socket.sid(), "read: {e}");
                        }
                        socket.fire(Event::Close).await;
                        break;
                    }
                }
            }
            socket.close().await;
        });
    }
}

/// Client-side packet state machine. Returns `false` when the session
/// should stop reading.
async fn handle_packet(socket: &Arc<Socket>, packet: Packet) -> bool {
    match packet.packet_kind {
        PacketKind::Close => {
            socket.fire(Event::Close).await;
            false
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
        PacketKind::Ping => {
            socket.fire(Event::Ping(packet.data)).await;
            true
        }
        PacketKind::Open | PacketKind::Upgrade | PacketKind::Noop => true,
    }
}

/// Rewrite an HTTP(S) endpoint to its websocket form and append the
/// handshake query.
fn dial_url(raw: &str) -> String {
    let url = if let Some(rest) = raw.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = raw.strip_prefix("https://") {
        format!("wss://{rest}")
    } else {
        raw.to_owned()
    };
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}EIO={PROTOCOL_VERSION}&transport=websocket")
}
