//! Application packet model.
//!
//! A [`Packet`] is one typed, namespaced message. Binary arguments travel
//! *next to* the JSON body on the wire (as separate engine messages, marked
//! by placeholder objects in the text codec); in memory they sit inline in
//! the argument list as [`Arg::Binary`], so a fully assembled packet always
//! satisfies the invariant that every attachment slot is filled before
//! dispatch.

use core::fmt;

use serde_json::Value;

/// Kind of an application packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Attach to a namespace.
    Connect,
    /// Detach from a namespace.
    Disconnect,
    /// A named event with arguments.
    Event,
    /// Reply to an event that carried an ack id.
    Ack,
    /// An error surfaced to the namespace.
    Error,
    /// EVENT with binary attachments.
    BinaryEvent,
    /// ACK with binary attachments.
    BinaryAck,
}

impl PacketType {
    /// Numeric wire value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Connect => 0,
            Self::Disconnect => 1,
            Self::Event => 2,
            Self::Ack => 3,
            Self::Error => 4,
            Self::BinaryEvent => 5,
            Self::BinaryAck => 6,
        }
    }

    /// Parse a numeric wire value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Connect),
            1 => Some(Self::Disconnect),
            2 => Some(Self::Event),
            3 => Some(Self::Ack),
            4 => Some(Self::Error),
            5 => Some(Self::BinaryEvent),
            6 => Some(Self::BinaryAck),
            _ => None,
        }
    }

    /// Whether this kind announces binary attachments in its header.
    #[must_use]
    pub const fn is_binary(self) -> bool {
        matches!(self, Self::BinaryEvent | Self::BinaryAck)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "CONNECT",
            Self::Disconnect => "DISCONNECT",
            Self::Event => "EVENT",
            Self::Ack => "ACK",
            Self::Error => "ERROR",
            Self::BinaryEvent => "BINARY_EVENT",
            Self::BinaryAck => "BINARY_ACK",
        };
        f.write_str(name)
    }
}

/// One argument of an EVENT or ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// A JSON value.
    Value(Value),
    /// A binary blob; encoded as a placeholder plus an attachment by the
    /// text codec, inline by the binary codec.
    Binary(Vec<u8>),
}

impl Arg {
    /// The JSON value, if this argument is one.
    #[must_use]
    pub const fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Binary(_) => None,
        }
    }

    /// The binary blob, if this argument is one.
    #[must_use]
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(data) => Some(data),
            Self::Value(_) => None,
        }
    }
}

/// Body of an application packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PacketData {
    /// No body (bare CONNECT/DISCONNECT).
    #[default]
    None,
    /// A single value (ERROR, CONNECT payloads).
    Scalar(Value),
    /// An argument list (EVENT/ACK); for events the first element is the
    /// event name.
    Args(Vec<Arg>),
}

/// An application packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet kind.
    pub kind: PacketType,
    /// Namespace, always starting with `/`; `/` is the default.
    pub namespace: String,
    /// Present iff the sender expects an acknowledgment, or this packet is
    /// one.
    pub id: Option<u64>,
    /// The body.
    pub data: PacketData,
}

impl Packet {
    /// An EVENT packet: the event name followed by its arguments.
    #[must_use]
    pub fn event(namespace: &str, event: &str, mut args: Vec<Arg>) -> Self {
        let mut data = Vec::with_capacity(args.len() + 1);
        data.push(Arg::Value(Value::String(event.to_owned())));
        data.append(&mut args);
        Self {
            kind: PacketType::Event,
            namespace: normalize(namespace),
            id: None,
            data: PacketData::Args(data),
        }
    }

    /// An ACK packet replying to `id`.
    #[must_use]
    pub fn ack(namespace: &str, id: u64, args: Vec<Arg>) -> Self {
        Self {
            kind: PacketType::Ack,
            namespace: normalize(namespace),
            id: Some(id),
            data: PacketData::Args(args),
        }
    }

    /// A CONNECT packet for a namespace.
    #[must_use]
    pub fn connect(namespace: &str) -> Self {
        Self {
            kind: PacketType::Connect,
            namespace: normalize(namespace),
            id: None,
            data: PacketData::None,
        }
    }

    /// A DISCONNECT packet for a namespace.
    #[must_use]
    pub fn disconnect(namespace: &str) -> Self {
        Self {
            kind: PacketType::Disconnect,
            namespace: normalize(namespace),
            id: None,
            data: PacketData::None,
        }
    }

    /// An ERROR packet.
    #[must_use]
    pub fn error(namespace: &str, data: Value) -> Self {
        Self {
            kind: PacketType::Error,
            namespace: normalize(namespace),
            id: None,
            data: PacketData::Scalar(data),
        }
    }

    /// Number of binary attachments carried by this packet.
    #[must_use]
    pub fn attachments(&self) -> usize {
        match &self.data {
            PacketData::Args(args) => args
                .iter()
                .filter(|arg| matches!(arg, Arg::Binary(_)))
                .count(),
            _ => 0,
        }
    }
}

/// Namespaces are `/`-rooted; the empty string is the default namespace.
pub(crate) fn normalize(namespace: &str) -> String {
    if namespace.is_empty() {
        "/".to_owned()
    } else if namespace.starts_with('/') {
        namespace.to_owned()
    } else {
        format!("/{namespace}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_type_round_trips() {
        for value in 0..=6 {
            let kind = PacketType::from_u8(value).expect("kind");
            assert_eq!(kind.as_u8(), value);
        }
        assert_eq!(PacketType::from_u8(7), None);
    }

    #[test]
    fn namespaces_are_rooted() {
        assert_eq!(Packet::connect("").namespace, "/");
        assert_eq!(Packet::connect("chat").namespace, "/chat");
        assert_eq!(Packet::connect("/chat").namespace, "/chat");
    }

    #[test]
    fn event_packets_lead_with_the_event_name() {
        let packet = Packet::event("/", "message", vec![Arg::Value("hi".into())]);
        let PacketData::Args(args) = &packet.data else {
            panic!("expected args");
        };
        assert_eq!(args[0], Arg::Value("message".into()));
        assert_eq!(args[1], Arg::Value("hi".into()));
        assert_eq!(packet.attachments(), 0);
    }

    #[test]
    fn attachments_count_binary_args() {
        let packet = Packet::event(
            "/",
            "blob",
            vec![
                Arg::Binary(vec![1]),
                Arg::Value("x".into()),
                Arg::Binary(vec![2]),
            ],
        );
        assert_eq!(packet.attachments(), 2);
    }
}
