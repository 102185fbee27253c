//! Error types.

use thiserror::Error;

/// Problems on the engine layer: transport faults, protocol violations,
/// and handshake failures.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The connection (or session) is closed; fatal.
    #[error("connection closed")]
    Closed,

    /// No packet arrived before the read deadline; fatal.
    #[error("read timeout")]
    ReadTimeout,

    /// The packet could not be written before the write deadline; fatal.
    #[error("write timeout")]
    WriteTimeout,

    /// The connection is paused for a transport upgrade; temporary.
    /// Callers wait on the session barrier and retry.
    #[error("connection paused")]
    Paused,

    /// The transport has no pause gate (streaming transports).
    #[error("transport pause unsupported")]
    PauseNotSupported,

    /// The HTTP request driving a poll cycle went away; the peer redials.
    #[error("request canceled")]
    RequestCanceled,

    /// A request body exceeded the size limit.
    #[error("body too large")]
    BodyTooLarge,

    /// Received data is invalid or unrecognized at the framing layer.
    #[error("invalid payload")]
    InvalidPayload,

    /// A protocol-valid packet arrived where it is not allowed
    /// (e.g. anything but OPEN as the first packet on dial).
    #[error("unexpected packet")]
    UnexpectedPacket,

    /// The handshake document could not be parsed.
    #[error("invalid handshake: {0}")]
    Handshake(String),

    /// Outbound queue is gone (session worker stopped).
    #[error("submit channel closed")]
    SubmitClosed,

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// HTTP transport error (e.g. a truncated request body).
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

impl EngineError {
    /// Whether the error only signals a paused connection, i.e. the caller
    /// should wait for the upgrade barrier and retry rather than tear down.
    #[must_use]
    pub const fn is_pause(&self) -> bool {
        matches!(self, Self::Paused)
    }
}
