//! WebSocket transport: one persistent duplex stream.
//!
//! Message kinds map directly onto websocket frame types; the engine packet
//! kind travels as a single leading byte in each frame - an ASCII digit in
//! text frames, the raw byte in binary frames.
//!
//! The stream is split into reader and writer halves, each behind its own
//! lock, so the session's read loop and outbound worker never contend.
//! Pausing is not supported: during an upgrade the websocket side is always
//! the *new* transport, so there is nothing to drain.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

use async_tungstenite::{
    tokio::{connect_async, ConnectStream, TokioAdapter},
    WebSocketStream,
};
use futures::{
    future::BoxFuture,
    lock::Mutex as AsyncMutex,
    stream::{SplitSink, SplitStream},
    FutureExt, SinkExt, StreamExt,
};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::time::{timeout_at, Instant};
use tungstenite::{protocol::Role, Message};

use crate::{
    error::EngineError,
    packet::{MessageKind, Packet, PacketKind},
    transport::{Conn, TRANSPORT_WEBSOCKET},
};

/// Stream type for connections accepted through an HTTP upgrade.
pub type ServerStream = TokioAdapter<TokioIo<Upgraded>>;

/// A [`Conn`] over a websocket stream.
pub struct WsConn<S> {
    reader: AsyncMutex<SplitStream<WebSocketStream<S>>>,
    writer: AsyncMutex<SplitSink<WebSocketStream<S>, Message>>,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
    closed: AtomicBool,
}

/// A websocket connection accepted by the server.
pub type ServerWsConn = WsConn<ServerStream>;

/// A websocket connection dialed by the client.
pub type ClientWsConn = WsConn<ConnectStream>;

impl<S> WsConn<S>
where
    S: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an established websocket stream.
    #[must_use]
    pub fn new(stream: WebSocketStream<S>) -> Self {
        let (writer, reader) = stream.split();
        Self {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn next_frame(&self) -> Result<Packet, EngineError> {
        let mut reader = self.reader.lock().await;
        loop {
            let message = match reader.next().await {
                Some(Ok(message)) => message,
                Some(Err(
                    tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
                )) => return Err(EngineError::Closed),
                Some(Err(e)) => return Err(EngineError::WebSocket(e)),
                None => return Err(EngineError::Closed),
            };
            match message {
                Message::Text(text) => return decode_frame(text.as_bytes(), MessageKind::Text),
                Message::Binary(bytes) => return decode_frame(&bytes, MessageKind::Binary),
                Message::Close(_) => return Err(EngineError::Closed),
                // Transport-level keep-alive, below the engine protocol.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }
}

/// Accept a server-side websocket over a completed HTTP upgrade.
pub async fn accept(upgraded: Upgraded) -> ServerWsConn {
    let io = TokioAdapter::new(TokioIo::new(upgraded));
    let stream = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
    WsConn::new(stream)
}

/// Dial a websocket endpoint.
///
/// # Errors
///
/// Returns the underlying websocket error when the connection or handshake
/// fails.
pub async fn dial(url: &str) -> Result<ClientWsConn, EngineError> {
    let (stream, _response) = connect_async(url).await?;
    Ok(WsConn::new(stream))
}

fn decode_frame(raw: &[u8], message_kind: MessageKind) -> Result<Packet, EngineError> {
    let (&kind_byte, data) = raw.split_first().ok_or(EngineError::InvalidPayload)?;
    let value = match message_kind {
        MessageKind::Text => kind_byte.wrapping_sub(b'0'),
        MessageKind::Binary => kind_byte,
    };
    let packet_kind = PacketKind::from_u8(value).ok_or(EngineError::InvalidPayload)?;
    Ok(Packet {
        message_kind,
        packet_kind,
        data: data.to_vec(),
    })
}

fn encode_frame(packet: &Packet) -> Result<Message, EngineError> {
    match packet.message_kind {
        MessageKind::Text => {
            let mut text = String::with_capacity(packet.data.len() + 1);
            text.push(char::from(packet.packet_kind.as_u8() + b'0'));
            let body =
                std::str::from_utf8(&packet.data).map_err(|_| EngineError::InvalidPayload)?;
            text.push_str(body);
            Ok(Message::text(text))
        }
        MessageKind::Binary => {
            let mut bytes = Vec::with_capacity(packet.data.len() + 1);
            bytes.push(packet.packet_kind.as_u8());
            bytes.extend_from_slice(&packet.data);
            Ok(Message::binary(bytes))
        }
    }
}

impl<S> Conn for WsConn<S>
where
    S: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + 'static,
{
    fn name(&self) -> &'static str {
        TRANSPORT_WEBSOCKET
    }

    fn read_packet(&self) -> BoxFuture<'_, Result<Packet, EngineError>> {
        async move {
            if self.is_closed() {
                return Err(EngineError::Closed);
            }
            let deadline = *self.read_deadline.lock().expect("deadline lock");
            match deadline {
                Some(deadline) => timeout_at(deadline, self.next_frame())
                    .await
                    .unwrap_or(Err(EngineError::ReadTimeout)),
                None => self.next_frame().await,
            }
        }
        .boxed()
    }

    fn write_packet(&self, packet: Packet) -> BoxFuture<'_, Result<(), EngineError>> {
        async move {
            if self.is_closed() {
                return Err(EngineError::Closed);
            }
            let message = encode_frame(&packet)?;
            let deadline = *self.write_deadline.lock().expect("deadline lock");
            let write = async {
                self.writer
                    .lock()
                    .await
                    .send(message)
                    .await
                    .map_err(|e| match e {
                        tungstenite::Error::ConnectionClosed
                        | tungstenite::Error::AlreadyClosed => EngineError::Closed,
                        other => EngineError::WebSocket(other),
                    })
            };
            match deadline {
                Some(deadline) => timeout_at(deadline, write)
                    .await
                    .unwrap_or(Err(EngineError::WriteTimeout)),
                None => write.await,
            }
        }
        .boxed()
    }

    fn set_read_deadline(&self, deadline: Instant) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        *self.read_deadline.lock().expect("deadline lock") = Some(deadline);
        Ok(())
    }

    fn set_write_deadline(&self, deadline: Instant) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        *self.write_deadline.lock().expect("deadline lock") = Some(deadline);
        Ok(())
    }

    fn pause(&self) -> Result<(), EngineError> {
        Err(EngineError::PauseNotSupported)
    }

    fn resume(&self) {}

    fn flush_out(&self) -> Vec<Packet> {
        Vec::new()
    }

    fn flush_in(&self) -> Vec<Packet> {
        Vec::new()
    }

    fn close(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        async move {
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            // Best effort: the peer may already be gone.
            let _ = self.writer.lock().await.send(Message::Close(None)).await;
            Ok(())
        }
        .boxed()
    }
}

impl<S> std::fmt::Debug for WsConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConn")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_carry_kind_byte() {
        let text = Packet::text(PacketKind::Message, b"hi".to_vec());
        match encode_frame(&text).expect("encode") {
            Message::Text(t) => assert_eq!(t.as_bytes(), b"4hi"),
            other => panic!("expected text frame, got {other:?}"),
        }

        let binary = Packet::binary(PacketKind::Message, vec![0xFE]);
        match encode_frame(&binary).expect("encode") {
            Message::Binary(b) => assert_eq!(&b[..], &[4, 0xFE]),
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    #[test]
    fn decode_inverts_encode() {
        let packet = Packet::text(PacketKind::Ping, b"probe".to_vec());
        let decoded = decode_frame(b"2probe", MessageKind::Text).expect("decode");
        assert_eq!(decoded, packet);

        let decoded = decode_frame(&[5], MessageKind::Binary).expect("decode");
        assert_eq!(decoded, Packet::binary(PacketKind::Upgrade, Vec::new()));
    }

    #[test]
    fn decode_rejects_bad_frames() {
        assert!(decode_frame(b"", MessageKind::Text).is_err());
        assert!(decode_frame(b"9", MessageKind::Text).is_err());
        assert!(decode_frame(&[9], MessageKind::Binary).is_err());
    }
}
