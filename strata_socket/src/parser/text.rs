//! Default text codec.
//!
//! Grammar of the text frame, left to right:
//!
//! ```text
//! packet  = kind-digit
//!           [ count "-" ]        ; only for BINARY_* kinds
//!           [ namespace "," ]    ; only when namespace != "/"
//!           [ ack-id ]
//!           [ json-body ]
//! ```
//!
//! Binary arguments are rewritten on the way out: the argument's position
//! gets a placeholder object `{"_placeholder":true,"num":<i>}` and the
//! bytes move into attachment `i`, sent as a separate binary engine message
//! directly after the text frame. On the way in, placeholder objects become
//! empty binary slots that fill as the attachments arrive; the packet is
//! emitted once the last slot fills.
//!
//! Examples of the wire form:
//!
//! ```text
//! 0/woot,                          CONNECT on /woot
//! 2["event",1,{}]                  EVENT on /
//! 2/test,1["event"]                EVENT on /test, ack id 1
//! 4"Unauthorized"                  ERROR
//! 52-["blob",{"_placeholder":true,"num":0},{"_placeholder":true,"num":1}]
//! ```

use std::sync::Arc;

use async_lock::Mutex;
use futures::{future::BoxFuture, FutureExt};
use serde_json::Value;

use strata_engine::MessageKind;

use crate::{
    error::SocketError,
    packet::{Arg, Packet, PacketData, PacketType},
    parser::{Decoder, Encoder, Frame, Parser},
};

/// The default text parser.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextParser;

impl Parser for TextParser {
    fn encoder(&self) -> Arc<dyn Encoder> {
        Arc::new(TextEncoder)
    }

    fn decoder(&self, capacity: usize) -> Arc<dyn Decoder> {
        Arc::new(TextDecoder::new(capacity))
    }
}

/// Stateless text encoder.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextEncoder;

impl Encoder for TextEncoder {
    fn encode(&self, packet: Packet) -> Result<Vec<Frame>, SocketError> {
        let mut kind = packet.kind;
        let mut buffer: Vec<Vec<u8>> = Vec::new();

        let body = match packet.data {
            PacketData::None => None,
            PacketData::Scalar(value) => Some(
                serde_json::to_string(&value)
                    .map_err(|e| SocketError::Malformed(e.to_string()))?,
            ),
            PacketData::Args(args) => {
                let mut rewritten = Vec::with_capacity(args.len());
                for arg in args {
                    match arg {
                        Arg::Value(value) => rewritten.push(value),
                        Arg::Binary(data) => {
                            rewritten.push(placeholder(buffer.len()));
                            buffer.push(data);
                        }
                    }
                }
                Some(
                    serde_json::to_string(&rewritten)
                        .map_err(|e| SocketError::Malformed(e.to_string()))?,
                )
            }
        };

        if !buffer.is_empty() {
            kind = match kind {
                PacketType::Event => PacketType::BinaryEvent,
                PacketType::Ack => PacketType::BinaryAck,
                other => other,
            };
        }

        let mut head = String::new();
        head.push(char::from(kind.as_u8() + b'0'));
        if kind.is_binary() {
            head.push_str(&buffer.len().to_string());
            head.push('-');
        }
        if packet.namespace != "/" {
            head.push_str(&packet.namespace);
            head.push(',');
        }
        if let Some(id) = packet.id {
            head.push_str(&id.to_string());
        }
        if let Some(body) = body {
            head.push_str(&body);
        }

        let mut frames = Vec::with_capacity(buffer.len() + 1);
        frames.push(Frame::text(head.into_bytes()));
        frames.extend(buffer.into_iter().map(Frame::binary));
        Ok(frames)
    }
}

fn placeholder(num: usize) -> Value {
    serde_json::json!({ "_placeholder": true, "num": num })
}

fn is_placeholder(value: &Value) -> bool {
    value
        .as_object()
        .and_then(|map| map.get("_placeholder"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// A BINARY_* packet waiting for its attachments.
#[derive(Debug)]
struct Pending {
    packet: Packet,
    /// Argument positions of the empty binary slots, in placeholder order.
    slots: Vec<usize>,
    filled: usize,
}

/// Per-session text decoder.
pub struct TextDecoder {
    pending: Mutex<Option<Pending>>,
    tx: async_channel::Sender<Packet>,
    rx: async_channel::Receiver<Packet>,
}

impl TextDecoder {
    /// A decoder whose output channel holds `capacity` packets.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity);
        Self {
            pending: Mutex::new(None),
            tx,
            rx,
        }
    }

    async fn emit(&self, packet: Packet) -> Result<(), SocketError> {
        self.tx
            .send(packet)
            .await
            .map_err(|_| SocketError::ChannelClosed)
    }
}

impl Decoder for TextDecoder {
    fn add(&self, kind: MessageKind, data: Vec<u8>) -> BoxFuture<'_, Result<(), SocketError>> {
        async move {
            match kind {
                MessageKind::Text => {
                    let (packet, slots) = decode(&data)?;
                    if slots.is_empty() {
                        // A complete packet supersedes any stale partial.
                        *self.pending.lock().await = None;
                        self.emit(packet).await
                    } else {
                        *self.pending.lock().await = Some(Pending {
                            packet,
                            slots,
                            filled: 0,
                        });
                        Ok(())
                    }
                }
                MessageKind::Binary => {
                    let mut guard = self.pending.lock().await;
                    let Some(pending) = guard.as_mut() else {
                        return Err(SocketError::UnknownPacket);
                    };
                    let index = pending.slots[pending.filled];
                    if let PacketData::Args(args) = &mut pending.packet.data {
                        args[index] = Arg::Binary(data);
                    }
                    pending.filled += 1;
                    if pending.filled == pending.slots.len() {
                        let done = guard.take().map(|p| p.packet);
                        drop(guard);
                        if let Some(packet) = done {
                            return self.emit(packet).await;
                        }
                    }
                    Ok(())
                }
            }
        }
        .boxed()
    }

    fn decoded(&self) -> async_channel::Receiver<Packet> {
        self.rx.clone()
    }
}

/// Decode one text frame. Returns the packet and the argument positions of
/// its still-empty binary slots.
fn decode(data: &[u8]) -> Result<(Packet, Vec<usize>), SocketError> {
    let (&first, _) = data.split_first().ok_or(SocketError::UnknownPacket)?;
    let kind = first
        .checked_sub(b'0')
        .and_then(PacketType::from_u8)
        .ok_or(SocketError::UnknownPacket)?;

    let mut i = 1;
    let mut attachments: usize = 0;
    if kind.is_binary() {
        while let Some(&b) = data.get(i) {
            if b == b'-' {
                i += 1;
                break;
            }
            if !b.is_ascii_digit() {
                return Err(SocketError::UnknownPacket);
            }
            attachments = attachments * 10 + usize::from(b - b'0');
            i += 1;
        }
    }

    let mut namespace = "/".to_owned();
    if data.get(i) == Some(&b'/') {
        let end = match data[i..].iter().position(|&b| b == b',') {
            Some(offset) => i + offset,
            None => data.len(),
        };
        namespace = String::from_utf8(data[i..end].to_vec())
            .map_err(|e| SocketError::Malformed(e.to_string()))?;
        i = if end < data.len() { end + 1 } else { end };
    }

    let mut id: Option<u64> = None;
    while let Some(&b) = data.get(i) {
        if !b.is_ascii_digit() {
            break;
        }
        id = Some(id.unwrap_or(0) * 10 + u64::from(b - b'0'));
        i += 1;
    }

    if i >= data.len() {
        if attachments > 0 {
            return Err(SocketError::UnknownPacket);
        }
        return Ok((
            Packet {
                kind,
                namespace,
                id,
                data: PacketData::None,
            },
            Vec::new(),
        ));
    }

    let body: Value = serde_json::from_slice(&data[i..])
        .map_err(|e| SocketError::Malformed(e.to_string()))?;

    let (packet_data, slots) = match kind {
        PacketType::Event | PacketType::Ack | PacketType::BinaryEvent | PacketType::BinaryAck => {
            let Value::Array(elements) = body else {
                return Err(SocketError::Malformed(
                    "data should be a list of arguments".into(),
                ));
            };
            let mut args = Vec::with_capacity(elements.len());
            let mut slots = Vec::with_capacity(attachments);
            for element in elements {
                if is_placeholder(&element) {
                    slots.push(args.len());
                    args.push(Arg::Binary(Vec::new()));
                } else {
                    args.push(Arg::Value(element));
                }
            }
            if slots.len() != attachments {
                return Err(SocketError::UnknownPacket);
            }
            (PacketData::Args(args), slots)
        }
        _ => (PacketData::Scalar(body), Vec::new()),
    };

    Ok((
        Packet {
            kind,
            namespace,
            id,
            data: packet_data,
        },
        slots,
    ))
}
