//! Engine packet model.
//!
//! A [`Packet`] is the unit exchanged between the two ends of an engine
//! session: a message kind (text or binary), a packet kind (control or
//! message), and an opaque payload. MESSAGE packets carry the application
//! layer; everything else is engine-internal control traffic.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Kind of an engine packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Sent from the server when a new session is opened; carries the
    /// handshake [`Parameters`].
    Open,
    /// Requests the close of the transport but does not shut down the
    /// session by itself.
    Close,
    /// Keep-alive probe. The receiver answers with a PONG carrying the
    /// same payload.
    Ping,
    /// Keep-alive answer.
    Pong,
    /// An actual message; the payload belongs to the application layer.
    Message,
    /// Sent by the client to ask the server to flush its cache on the old
    /// transport and switch to the new one.
    Upgrade,
    /// No-op, used primarily to force a poll cycle when an incoming
    /// streaming connection arrives mid-poll.
    Noop,
}

impl PacketKind {
    /// Numeric wire value of this kind.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Close => 1,
            Self::Ping => 2,
            Self::Pong => 3,
            Self::Message => 4,
            Self::Upgrade => 5,
            Self::Noop => 6,
        }
    }

    /// Parse a numeric wire value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Open),
            1 => Some(Self::Close),
            2 => Some(Self::Ping),
            3 => Some(Self::Pong),
            4 => Some(Self::Message),
            5 => Some(Self::Upgrade),
            6 => Some(Self::Noop),
            _ => None,
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Message => "message",
            Self::Upgrade => "upgrade",
            Self::Noop => "noop",
        };
        f.write_str(name)
    }
}

/// Encoding of an engine packet's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Payload is UTF-8 text.
    Text,
    /// Payload is raw bytes.
    Binary,
}

/// A single engine packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Whether the payload travels as text or binary.
    pub message_kind: MessageKind,
    /// What the packet means to the engine.
    pub packet_kind: PacketKind,
    /// Opaque payload bytes.
    pub data: Vec<u8>,
}

impl Packet {
    /// A text packet.
    #[must_use]
    pub const fn text(packet_kind: PacketKind, data: Vec<u8>) -> Self {
        Self {
            message_kind: MessageKind::Text,
            packet_kind,
            data,
        }
    }

    /// A binary packet.
    #[must_use]
    pub const fn binary(packet_kind: PacketKind, data: Vec<u8>) -> Self {
        Self {
            message_kind: MessageKind::Binary,
            packet_kind,
            data,
        }
    }

    /// The NOOP packet synthesized for paused poll cycles.
    #[must_use]
    pub const fn noop() -> Self {
        Self::text(PacketKind::Noop, Vec::new())
    }
}

/// Session attributes sent from server to client in the OPEN packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameters {
    /// Session id assigned by the server.
    pub sid: String,
    /// Transport names the session may upgrade to.
    pub upgrades: Vec<String>,
    /// Interval between client keep-alive pings, in milliseconds.
    #[serde(rename = "pingInterval")]
    pub ping_interval: u64,
    /// Grace period for a ping answer, in milliseconds.
    #[serde(rename = "pingTimeout")]
    pub ping_timeout: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_wire_value() {
        for value in 0..=6 {
            let kind = PacketKind::from_u8(value).expect("valid kind");
            assert_eq!(kind.as_u8(), value);
        }
        assert_eq!(PacketKind::from_u8(7), None);
    }

    #[test]
    fn parameters_use_wire_field_names() {
        let params = Parameters {
            sid: "A1".into(),
            upgrades: vec!["websocket".into()],
            ping_interval: 25000,
            ping_timeout: 5000,
        };
        let json = serde_json::to_string(&params).expect("serialize");
        assert_eq!(
            json,
            r#"{"sid":"A1","upgrades":["websocket"],"pingInterval":25000,"pingTimeout":5000}"#
        );
    }
}
