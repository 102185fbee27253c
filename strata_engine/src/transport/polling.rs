//! Long-polling transport: a virtual duplex connection over HTTP
//! request/response pairs.
//!
//! There are no background tasks here. The session's read loop and outbound
//! worker sit on one side of two bounded queues; the server's HTTP handlers
//! push to and pull from the other side:
//!
//! ```text
//! POST body ──► payload decode ──► in  queue ──► read_packet()
//! write_packet() ──► out queue ──► GET response (one frame)
//! ```
//!
//! A `GET` blocks until a packet is queued, the connection pauses (a NOOP is
//! synthesized so the peer's long poll is released), the connection closes,
//! or the serving side's cancellation signal fires (the poll fails with
//! [`EngineError::RequestCanceled`] and the peer redials). The response
//! encoding is chosen by query parameters: JSONP when a callback token is
//! present, the text framing when `b64=1`, and the binary framing
//! otherwise. A `POST` carries a payload batch whose framing is announced
//! by its `Content-Type`.
//!
//! While paused, new `POST`s are rejected and reads/writes fail with
//! [`EngineError::Paused`]; the upgrade drains both queues through
//! [`Conn::flush_out`]/[`Conn::flush_in`] before the swap.

use std::sync::Mutex;

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, Method, Request, Response, StatusCode};
use tokio::{
    sync::watch,
    time::{timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{Framing, Payload},
    error::EngineError,
    packet::Packet,
    transport::{Conn, TRANSPORT_POLLING},
};

/// Default capacity of the `in` and `out` queues.
pub const DEFAULT_BUFFER: usize = 8;

/// Largest request body accepted on a `POST`.
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

/// A polling connection.
///
/// Created by the server when a session's first request arrives with
/// `transport=polling`; driven by [`handle`](PollingConn::handle) for every
/// subsequent request carrying the same session id.
#[derive(Debug)]
pub struct PollingConn {
    in_tx: async_channel::Sender<Packet>,
    in_rx: async_channel::Receiver<Packet>,
    out_tx: async_channel::Sender<Packet>,
    out_rx: async_channel::Receiver<Packet>,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
    paused: watch::Sender<bool>,
    closed: CancellationToken,
}

impl PollingConn {
    /// A new polling connection with `buffer`-sized queues.
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        let (in_tx, in_rx) = async_channel::bounded(buffer);
        let (out_tx, out_rx) = async_channel::bounded(buffer);
        let (paused, _) = watch::channel(false);
        Self {
            in_tx,
            in_rx,
            out_tx,
            out_rx,
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            paused,
            closed: CancellationToken::new(),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Completes when the connection enters the paused state.
    async fn pause_signal(&self) {
        let mut rx = self.paused.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                // Sender lives as long as `self`; unreachable in practice.
                futures::future::pending::<()>().await;
            }
        }
    }

    fn guard(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        if self.is_paused() {
            return Err(EngineError::Paused);
        }
        Ok(())
    }

    /// Dequeue the next packet bound for the peer, used by the `GET`
    /// handler. While paused, yields a synthetic NOOP so the peer's long
    /// poll is released. When `canceled` fires the request is going away
    /// and the poll fails with [`EngineError::RequestCanceled`]; the peer
    /// redials.
    async fn read_outbound(&self, canceled: &CancellationToken) -> Result<Packet, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        tokio::select! {
            () = self.closed.cancelled() => Err(EngineError::Closed),
            () = canceled.cancelled() => Err(EngineError::RequestCanceled),
            packet = self.out_rx.recv() => packet.map_err(|_| EngineError::Closed),
            () = self.pause_signal() => Ok(Packet::noop()),
        }
    }

    /// Decode a `POST` body and push each packet onto the `in` queue in
    /// order.
    async fn receive_payload(&self, body: &[u8], framing: Framing) -> Result<(), EngineError> {
        let payload = Payload::decode(body, framing)?;
        for packet in payload.packets {
            tokio::select! {
                () = self.closed.cancelled() => return Err(EngineError::Closed),
                sent = self.in_tx.send(packet) => sent.map_err(|_| EngineError::Closed)?,
            }
        }
        Ok(())
    }

    /// Serve one HTTP exchange on this connection.
    ///
    /// `jsonp` and `b64` come from the request query and select the `GET`
    /// response encoding. `canceled` is the serving side's cancellation
    /// signal; a `GET` caught mid-poll by it is answered with 204 so the
    /// peer redials.
    pub(crate) async fn handle(
        &self,
        req: Request<Incoming>,
        jsonp: Option<String>,
        b64: bool,
        canceled: &CancellationToken,
    ) -> Response<Full<Bytes>> {
        if self.is_closed() {
            return plain_response(StatusCode::BAD_REQUEST, "polling connection closed");
        }
        let method = req.method().clone();
        match method {
            Method::GET => match self.read_outbound(canceled).await {
                Ok(packet) => get_response(&packet, jsonp.as_deref(), b64),
                Err(EngineError::RequestCanceled) => {
                    // Temporary: nothing was dequeued, the poll just ended.
                    plain_response(StatusCode::NO_CONTENT, "")
                }
                Err(e) => plain_response(StatusCode::NOT_FOUND, &e.to_string()),
            },
            Method::POST => {
                if self.is_paused() {
                    return plain_response(StatusCode::BAD_REQUEST, "connection paused");
                }
                let framing = match post_framing(&req) {
                    Ok(framing) => framing,
                    Err(message) => return plain_response(StatusCode::BAD_REQUEST, message),
                };
                let body = match read_body(req).await {
                    Ok(body) => body,
                    Err(e) => return plain_response(StatusCode::BAD_REQUEST, &e.to_string()),
                };
                match self.receive_payload(&body, framing).await {
                    Ok(()) => plain_response(StatusCode::OK, "OK"),
                    Err(EngineError::InvalidPayload) => {
                        plain_response(StatusCode::BAD_REQUEST, "invalid payload")
                    }
                    Err(e) => plain_response(StatusCode::NOT_FOUND, &e.to_string()),
                }
            }
            _ => plain_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        }
    }
}

impl Conn for PollingConn {
    fn name(&self) -> &'static str {
        TRANSPORT_POLLING
    }

    fn read_packet(&self) -> BoxFuture<'_, Result<Packet, EngineError>> {
        async move {
            if self.is_closed() {
                return Err(EngineError::Closed);
            }
            let deadline = *self.read_deadline.lock().expect("deadline lock");
            let read = async {
                tokio::select! {
                    () = self.closed.cancelled() => Err(EngineError::Closed),
                    packet = self.in_rx.recv() => packet.map_err(|_| EngineError::Closed),
                    () = self.pause_signal() => Err(EngineError::Paused),
                }
            };
            match deadline {
                Some(deadline) => timeout_at(deadline, read)
                    .await
                    .unwrap_or(Err(EngineError::ReadTimeout)),
                None => read.await,
            }
        }
        .boxed()
    }

    fn write_packet(&self, packet: Packet) -> BoxFuture<'_, Result<(), EngineError>> {
        async move {
            if self.is_closed() {
                return Err(EngineError::Closed);
            }
            let deadline = *self.write_deadline.lock().expect("deadline lock");
            let write = async {
                tokio::select! {
                    () = self.closed.cancelled() => Err(EngineError::Closed),
                    sent = self.out_tx.send(packet) => sent.map_err(|_| EngineError::Closed),
                    () = self.pause_signal() => Err(EngineError::Paused),
                }
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
        self.guard()?;
        *self.read_deadline.lock().expect("deadline lock") = Some(deadline);
        Ok(())
    }

    fn set_write_deadline(&self, deadline: Instant) -> Result<(), EngineError> {
        self.guard()?;
        *self.write_deadline.lock().expect("deadline lock") = Some(deadline);
        Ok(())
    }

    fn pause(&self) -> Result<(), EngineError> {
        let _ = self.paused.send(true);
        Ok(())
    }

    fn resume(&self) {
        let _ = self.paused.send(false);
    }

    fn flush_out(&self) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Ok(packet) = self.out_rx.try_recv() {
            packets.push(packet);
        }
        packets
    }

    fn flush_in(&self) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Ok(packet) = self.in_rx.try_recv() {
            packets.push(packet);
        }
        packets
    }

    fn close(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        async move {
            self.closed.cancel();
            Ok(())
        }
        .boxed()
    }

    fn as_polling(&self) -> Option<&PollingConn> {
        Some(self)
    }
}

/// Build the `GET` response for one packet in the encoding the query asked
/// for.
fn get_response(packet: &Packet, jsonp: Option<&str>, b64: bool) -> Response<Full<Bytes>> {
    let (content_type, body) = if let Some(token) = jsonp {
        let frame = packet.encode(Framing::Text);
        let escaped =
            serde_json::to_string(&String::from_utf8_lossy(&frame)).unwrap_or_default();
        (
            "text/javascript; charset=UTF-8",
            format!("___eio[{token}]({escaped});").into_bytes(),
        )
    } else if b64 {
        ("text/plain; charset=UTF-8", packet.encode(Framing::Text))
    } else {
        ("application/octet-stream", packet.encode(Framing::Binary))
    };

    #[allow(clippy::expect_used)]
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", content_type)
        .body(Full::new(Bytes::from(body)))
        .expect("static response")
}

/// Determine the payload framing from a `POST`'s `Content-Type`.
fn post_framing<T>(req: &Request<T>) -> Result<Framing, &'static str> {
    let header = req
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .ok_or("missing content type")?;

    let mut parts = header.split(';').map(str::trim);
    let media_type = parts.next().unwrap_or_default().to_ascii_lowercase();
    match media_type.as_str() {
        "application/octet-stream" => Ok(Framing::Binary),
        "text/plain" => {
            let charset_ok = parts
                .filter_map(|p| p.split_once('='))
                .any(|(k, v)| {
                    k.trim().eq_ignore_ascii_case("charset")
                        && v.trim().trim_matches('"').eq_ignore_ascii_case("utf-8")
                });
            if charset_ok {
                Ok(Framing::Text)
            } else {
                Err("invalid charset")
            }
        }
        _ => Err("invalid media type"),
    }
}

async fn read_body(req: Request<Incoming>) -> Result<Vec<u8>, EngineError> {
    let collected = req.into_body().collect().await?;
    let bytes = collected.to_bytes();
    if bytes.len() > MAX_BODY_SIZE {
        return Err(EngineError::BodyTooLarge);
    }
    Ok(bytes.to_vec())
}

#[allow(clippy::expect_used)]
fn plain_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(message.to_owned())))
        .expect("static response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketKind;
    use std::time::Duration;

    #[tokio::test]
    async fn packets_flow_both_directions() {
        let conn = PollingConn::new(DEFAULT_BUFFER);

        conn.receive_payload(b"6:4hello", Framing::Text)
            .await
            .expect("receive");
        let packet = conn.read_packet().await.expect("read");
        assert_eq!(packet, Packet::text(PacketKind::Message, b"hello".to_vec()));

        conn.write_packet(Packet::text(PacketKind::Message, b"back".to_vec()))
            .await
            .expect("write");
        let out = conn
            .read_outbound(&CancellationToken::new())
            .await
            .expect("poll");
        assert_eq!(out.data, b"back");
    }

    #[tokio::test]
    async fn post_batches_preserve_order() {
        let conn = PollingConn::new(DEFAULT_BUFFER);
        conn.receive_payload(b"4:4one4:4two6:4three", Framing::Text)
            .await
            .expect("receive");
        for expected in ["one", "two", "three"] {
            let packet = conn.read_packet().await.expect("read");
            assert_eq!(packet.data, expected.as_bytes());
        }
    }

    #[tokio::test]
    async fn paused_get_synthesizes_noop() {
        let conn = PollingConn::new(DEFAULT_BUFFER);
        conn.pause().expect("pause");

        let canceled = CancellationToken::new();
        let packet = tokio::time::timeout(Duration::from_secs(1), conn.read_outbound(&canceled))
            .await
            .expect("not blocked")
            .expect("poll");
        assert_eq!(packet.packet_kind, PacketKind::Noop);
    }

    #[tokio::test]
    async fn canceled_get_returns_request_canceled() {
        let conn = PollingConn::new(DEFAULT_BUFFER);
        let canceled = CancellationToken::new();

        let poll = {
            let canceled = canceled.clone();
            async move { conn.read_outbound(&canceled).await }
        };
        let poll = tokio::spawn(poll);
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceled.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(1), poll)
            .await
            .expect("poll released")
            .expect("poll task");
        assert!(matches!(outcome, Err(EngineError::RequestCanceled)));
    }

    #[tokio::test]
    async fn paused_connection_rejects_io() {
        let conn = PollingConn::new(DEFAULT_BUFFER);
        conn.pause().expect("pause");

        assert!(matches!(
            conn.read_packet().await,
            Err(EngineError::Paused)
        ));
        assert!(matches!(
            conn.write_packet(Packet::noop()).await,
            Err(EngineError::Paused)
        ));
        assert!(matches!(
            conn.set_read_deadline(Instant::now()),
            Err(EngineError::Paused)
        ));

        conn.resume();
        conn.write_packet(Packet::noop()).await.expect("resumed");
    }

    #[tokio::test]
    async fn expired_read_deadline_times_out() {
        let conn = PollingConn::new(DEFAULT_BUFFER);
        conn.set_read_deadline(Instant::now() + Duration::from_millis(10))
            .expect("deadline");
        assert!(matches!(
            conn.read_packet().await,
            Err(EngineError::ReadTimeout)
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fatal() {
        let conn = PollingConn::new(DEFAULT_BUFFER);
        conn.close().await.expect("close");
        conn.close().await.expect("close again");

        assert!(matches!(
            conn.read_packet().await,
            Err(EngineError::Closed)
        ));
        assert!(matches!(
            conn.write_packet(Packet::noop()).await,
            Err(EngineError::Closed)
        ));
    }

    #[tokio::test]
    async fn flush_drains_queues_in_order() {
        let conn = PollingConn::new(DEFAULT_BUFFER);
        for text in ["a", "b"] {
            conn.write_packet(Packet::text(PacketKind::Message, text.into()))
                .await
                .expect("write");
        }
        conn.receive_payload(b"2:4c", Framing::Text)
            .await
            .expect("receive");

        let out: Vec<_> = conn.flush_out().into_iter().map(|p| p.data).collect();
        assert_eq!(out, vec![b"a".to_vec(), b"b".to_vec()]);
        let inp: Vec<_> = conn.flush_in().into_iter().map(|p| p.data).collect();
        assert_eq!(inp, vec![b"c".to_vec()]);
        assert!(conn.flush_out().is_empty());
    }

    #[test]
    fn get_encodings() {
        let packet = Packet::binary(PacketKind::Message, vec![1, 2, 3]);

        let resp = get_response(&packet, None, false);
        assert_eq!(
            resp.headers()["content-type"],
            "application/octet-stream"
        );

        let resp = get_response(&packet, None, true);
        assert_eq!(resp.headers()["content-type"], "text/plain; charset=UTF-8");

        let text = Packet::text(PacketKind::Open, b"{}".to_vec());
        let resp = get_response(&text, Some("0"), false);
        assert_eq!(
            resp.headers()["content-type"],
            "text/javascript; charset=UTF-8"
        );
    }

    #[test]
    fn post_framing_follows_content_type() {
        let req = |ct: &str| {
            Request::builder()
                .method(Method::POST)
                .header("content-type", ct)
                .body(())
                .expect("request")
        };
        assert_eq!(
            post_framing(&req("application/octet-stream")).expect("framing"),
            Framing::Binary
        );
        assert_eq!(
            post_framing(&req("text/plain; charset=utf-8")).expect("framing"),
            Framing::Text
        );
        assert_eq!(
            post_framing(&req("text/plain;charset=UTF-8")).expect("framing"),
            Framing::Text
        );
        assert!(post_framing(&req("application/json")).is_err());
        assert!(post_framing(&req("text/plain")).is_err());
    }
}
