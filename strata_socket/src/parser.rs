//! The parser seam: interchangeable application-packet codecs.
//!
//! An [`Encoder`] turns one [`Packet`] into the ordered engine messages that
//! carry it - for the text codec, one text frame plus one binary frame per
//! attachment; for the binary codec, a single schema-encoded frame. A
//! [`Decoder`] is fed engine messages as they arrive and emits fully
//! reassembled packets into a bounded channel; a BINARY_* packet stays
//! buffered inside the decoder until all of its attachments have landed.
//!
//! Backpressure: when consumers of [`Decoder::decoded`] fall behind, `add`
//! blocks on the channel, which stalls that session's read loop and nothing
//! else. The channel capacity is chosen at decoder construction
//! ([`Parser::decoder`]).

use std::sync::Arc;

use futures::future::BoxFuture;

use strata_engine::MessageKind;

use crate::{error::SocketError, packet::Packet};

pub mod binary;
pub mod text;

pub use binary::BinaryParser;
pub use text::TextParser;

/// Default capacity of a decoder's output channel.
pub const DEFAULT_DECODER_BUFFER: usize = 8;

/// One engine message produced by an encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Text or binary engine message.
    pub kind: MessageKind,
    /// The message body.
    pub data: Vec<u8>,
}

impl Frame {
    /// A text frame.
    #[must_use]
    pub const fn text(data: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Text,
            data,
        }
    }

    /// A binary frame.
    #[must_use]
    pub const fn binary(data: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Binary,
            data,
        }
    }
}

/// Packet → engine messages.
pub trait Encoder: Send + Sync {
    /// Encode one packet into the engine messages that carry it, in the
    /// order they must be sent.
    ///
    /// # Errors
    ///
    /// Fails when the packet body cannot be serialized.
    fn encode(&self, packet: Packet) -> Result<Vec<Frame>, SocketError>;
}

/// Engine messages → packets, with multi-message reassembly.
pub trait Decoder: Send + Sync {
    /// Feed one received engine message.
    ///
    /// Blocks when the decoded-packet channel is full.
    ///
    /// # Errors
    ///
    /// Fails on malformed input - a header that does not parse, or a binary
    /// attachment with no packet waiting for one.
    fn add(&self, kind: MessageKind, data: Vec<u8>) -> BoxFuture<'_, Result<(), SocketError>>;

    /// The stream of fully reassembled packets.
    fn decoded(&self) -> async_channel::Receiver<Packet>;
}

/// A matched encoder/decoder pair.
pub trait Parser: Send + Sync + std::fmt::Debug {
    /// The (stateless) encoder.
    fn encoder(&self) -> Arc<dyn Encoder>;

    /// A fresh per-session decoder whose output channel holds `capacity`
    /// packets.
    fn decoder(&self, capacity: usize) -> Arc<dyn Decoder>;
}
