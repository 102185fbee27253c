//! Binary schema codec.
//!
//! The whole packet - kind, namespace, optional ack id, argument list -
//! is serialized as one binary engine message; binary arguments stay
//! inline, so there are never placeholders or attachment counts and every
//! packet is complete on arrival.
//!
//! CONNECT, DISCONNECT, and ERROR still travel as a small JSON text
//! message: those are exchanged before both ends have necessarily agreed on
//! a parser, and keeping them text makes them inspectable on the wire.

use std::sync::Arc;

use futures::{future::BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use strata_engine::MessageKind;

use crate::{
    error::SocketError,
    packet::{Arg, Packet, PacketData, PacketType},
    parser::{Decoder, Encoder, Frame, Parser},
};

/// The binary schema parser.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryParser;

impl Parser for BinaryParser {
    fn encoder(&self) -> Arc<dyn Encoder> {
        Arc::new(BinaryEncoder)
    }

    fn decoder(&self, capacity: usize) -> Arc<dyn Decoder> {
        Arc::new(BinaryDecoder::new(capacity))
    }
}

/// Schema of one binary-encoded packet.
#[derive(Debug, Serialize, Deserialize)]
struct WirePacket {
    kind: u8,
    nsp: String,
    id: Option<u64>,
    args: Vec<WireArg>,
}

/// One argument in the schema. JSON values travel as their serialized
/// text - the schema format is not self-describing, arbitrary JSON is.
#[derive(Debug, Serialize, Deserialize)]
enum WireArg {
    Json(String),
    Binary(Vec<u8>),
}

/// JSON form of the control packets (CONNECT/DISCONNECT/ERROR).
#[derive(Debug, Serialize, Deserialize)]
struct ControlWire {
    #[serde(rename = "type")]
    kind: u8,
    nsp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
}

/// Stateless binary encoder.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryEncoder;

impl Encoder for BinaryEncoder {
    fn encode(&self, packet: Packet) -> Result<Vec<Frame>, SocketError> {
        match packet.kind {
            PacketType::Connect | PacketType::Disconnect | PacketType::Error => {
                let control = ControlWire {
                    kind: packet.kind.as_u8(),
                    nsp: packet.namespace,
                    data: match packet.data {
                        PacketData::Scalar(value) => Some(value),
                        PacketData::None | PacketData::Args(_) => None,
                    },
                    id: packet.id,
                };
                let body = serde_json::to_vec(&control)
                    .map_err(|e| SocketError::Malformed(e.to_string()))?;
                Ok(vec![Frame::text(body)])
            }
            _ => {
                let args = match packet.data {
                    PacketData::Args(args) => args,
                    PacketData::None => Vec::new(),
                    PacketData::Scalar(value) => vec![Arg::Value(value)],
                };
                let wire_args = args
                    .into_iter()
                    .map(|arg| match arg {
                        Arg::Value(value) => serde_json::to_string(&value)
                            .map(WireArg::Json)
                            .map_err(|e| SocketError::Malformed(e.to_string())),
                        Arg::Binary(data) => Ok(WireArg::Binary(data)),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let wire = WirePacket {
                    kind: packet.kind.as_u8(),
                    nsp: packet.namespace,
                    id: packet.id,
                    args: wire_args,
                };
                let body = bincode::serde::encode_to_vec(&wire, bincode::config::standard())
                    .map_err(|e| SocketError::Malformed(e.to_string()))?;
                Ok(vec![Frame::binary(body)])
            }
        }
    }
}

/// Per-session binary decoder. No reassembly state: every message is a
/// whole packet.
pub struct BinaryDecoder {
    tx: async_channel::Sender<Packet>,
    rx: async_channel::Receiver<Packet>,
}

impl BinaryDecoder {
    /// A decoder whose output channel holds `capacity` packets.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity);
        Self { tx, rx }
    }
}

impl Decoder for BinaryDecoder {
    fn add(&self, kind: MessageKind, data: Vec<u8>) -> BoxFuture<'_, Result<(), SocketError>> {
        async move {
            let packet = match kind {
                MessageKind::Text => {
                    let control: ControlWire = serde_json::from_slice(&data)
                        .map_err(|e| SocketError::Malformed(e.to_string()))?;
                    Packet {
                        kind: PacketType::from_u8(control.kind)
                            .ok_or(SocketError::UnknownPacket)?,
                        namespace: crate::packet::normalize(&control.nsp),
                        id: control.id,
                        data: control.data.map_or(PacketData::None, PacketData::Scalar),
                    }
                }
                MessageKind::Binary => {
                    let (wire, _len): (WirePacket, usize) =
                        bincode::serde::decode_from_slice(&data, bincode::config::standard())
                            .map_err(|e| SocketError::Malformed(e.to_string()))?;
                    let args = wire
                        .args
                        .into_iter()
                        .map(|arg| match arg {
                            WireArg::Json(text) => serde_json::from_str(&text)
                                .map(Arg::Value)
                                .map_err(|e| SocketError::Malformed(e.to_string())),
                            WireArg::Binary(bytes) => Ok(Arg::Binary(bytes)),
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    Packet {
                        kind: PacketType::from_u8(wire.kind).ok_or(SocketError::UnknownPacket)?,
                        namespace: crate::packet::normalize(&wire.nsp),
                        id: wire.id,
                        data: PacketData::Args(args),
                    }
                }
            };
            self.tx
                .send(packet)
                .await
                .map_err(|_| SocketError::ChannelClosed)
        }
        .boxed()
    }

    fn decoded(&self) -> async_channel::Receiver<Packet> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_round_trip_in_one_binary_message() {
        let mut packet = Packet::event(
            "/chat",
            "blob",
            vec![
                Arg::Value("x".into()),
                Arg::Binary(vec![1, 2, 3]),
                Arg::Value(7.into()),
            ],
        );
        packet.id = Some(42);

        let frames = BinaryEncoder.encode(packet.clone()).expect("encode");
        assert_eq!(frames.len(), 1, "binary args stay inline");
        assert_eq!(frames[0].kind, MessageKind::Binary);

        let decoder = BinaryDecoder::new(8);
        decoder
            .add(frames[0].kind, frames[0].data.clone())
            .await
            .expect("add");
        let decoded = decoder.decoded().try_recv().expect("complete");
        assert_eq!(decoded, packet);
        assert_eq!(decoded.attachments(), 1);
    }

    #[tokio::test]
    async fn control_packets_stay_textual() {
        let frames = BinaryEncoder
            .encode(Packet::connect("/chat"))
            .expect("encode");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, MessageKind::Text);
        assert_eq!(frames[0].data, br#"{"type":0,"nsp":"/chat"}"#);

        let decoder = BinaryDecoder::new(8);
        decoder
            .add(MessageKind::Text, frames[0].data.clone())
            .await
            .expect("add");
        let decoded = decoder.decoded().try_recv().expect("packet");
        assert_eq!(decoded, Packet::connect("/chat"));
    }

    #[tokio::test]
    async fn error_packets_carry_their_payload() {
        let frames = BinaryEncoder
            .encode(Packet::error("/", "Unauthorized".into()))
            .expect("encode");
        assert_eq!(
            frames[0].data,
            br#"{"type":4,"nsp":"/","data":"Unauthorized"}"#
        );
    }

    #[tokio::test]
    async fn malformed_input_is_rejected() {
        let decoder = BinaryDecoder::new(8);
        assert!(decoder
            .add(MessageKind::Text, b"not json".to_vec())
            .await
            .is_err());
        assert!(decoder
            .add(MessageKind::Binary, vec![0xFF; 3])
            .await
            .is_err());
    }
}
