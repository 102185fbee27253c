//! Error types.

use thiserror::Error;

use strata_engine::EngineError;

/// Problems on the application layer: parsing, emission, attachment.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Packet kind out of range or header malformed.
    #[error("unknown packet")]
    UnknownPacket,

    /// Structurally invalid packet body.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// The decoded-packet channel is gone (session torn down).
    #[error("decoder channel closed")]
    ChannelClosed,

    /// Argument conversion failed while building a packet.
    #[error(transparent)]
    Args(#[from] ArgsError),

    /// The engine session refused the packet.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Problems converting between wire arguments and handler parameter types.
#[derive(Debug, Error)]
pub enum ArgsError {
    /// Fewer wire arguments than the handler declares.
    #[error("not enough arguments: wanted index {0}")]
    NotEnough(usize),

    /// A JSON argument did not deserialize into the declared type.
    #[error("argument {index}: {source}")]
    Invalid {
        /// Zero-based argument position.
        index: usize,
        /// Underlying deserialization error.
        source: serde_json::Error,
    },

    /// The handler declares a binary parameter but the wire argument is
    /// JSON.
    #[error("argument {0}: expected binary attachment")]
    ExpectedBinary(usize),

    /// The handler declares a JSON parameter but the wire argument is a
    /// binary attachment.
    #[error("argument {0}: expected JSON value")]
    ExpectedValue(usize),

    /// A value could not be serialized into a wire argument.
    #[error("serialize: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Why a waiting acknowledgment future resolved without a reply.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AckError {
    /// The namespace detached or the session closed before the reply
    /// arrived; the pending entry was dropped.
    #[error("acknowledgment canceled")]
    Canceled,
}

/// Faults confined to dispatching one inbound packet. Reported through the
/// per-namespace error callback; they never close the session.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Argument unmarshalling failed.
    #[error(transparent)]
    Args(#[from] ArgsError),

    /// The handler panicked; the panic was contained.
    #[error("handler panicked")]
    HandlerPanic,

    /// The packet had no usable event name.
    #[error("unknown packet")]
    UnknownPacket,
}
