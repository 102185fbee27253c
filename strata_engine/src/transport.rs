//! Transport abstraction.
//!
//! A [`Conn`] is a bidirectional engine-packet channel with per-direction
//! deadlines and a pause gate. Two implementations exist:
//!
//! * [`polling`](crate::transport::polling) - a *virtual* connection built
//!   over stateless request/response pairs, backed by bounded queues.
//! * [`websocket`](crate::transport::websocket) - one persistent duplex
//!   stream; message kinds map directly onto websocket frame types.
//!
//! A session owns its current `Conn` exclusively and may atomically swap it
//! for another one mid-flight (the upgrade); `pause`, `flush_out`, and
//! `flush_in` exist for that handoff.

use futures::future::BoxFuture;
use tokio::time::Instant;

use crate::{error::EngineError, packet::Packet};

pub mod polling;
pub mod websocket;

/// Wire name of the long-polling transport.
pub const TRANSPORT_POLLING: &str = "polling";

/// Wire name of the websocket transport.
pub const TRANSPORT_WEBSOCKET: &str = "websocket";

/// A bidirectional engine connection.
///
/// All methods take `&self`; implementations use interior mutability so a
/// connection can be shared between a session's read loop, its outbound
/// worker, and the HTTP handlers driving it.
pub trait Conn: Send + Sync + std::fmt::Debug {
    /// Wire name of this transport.
    fn name(&self) -> &'static str;

    /// Read the next packet.
    ///
    /// Honors the read deadline ([`EngineError::ReadTimeout`] on expiry) and
    /// the pause gate ([`EngineError::Paused`] while paused). After close,
    /// fails with [`EngineError::Closed`].
    fn read_packet(&self) -> BoxFuture<'_, Result<Packet, EngineError>>;

    /// Write one packet.
    ///
    /// Honors the write deadline and the pause gate like
    /// [`read_packet`](Conn::read_packet).
    fn write_packet(&self, packet: Packet) -> BoxFuture<'_, Result<(), EngineError>>;

    /// Set the deadline applied to the next blocking read.
    ///
    /// # Errors
    ///
    /// Fails with [`EngineError::Paused`] while the connection is paused and
    /// [`EngineError::Closed`] after close.
    fn set_read_deadline(&self, deadline: Instant) -> Result<(), EngineError>;

    /// Set the deadline applied to the next blocking write.
    ///
    /// # Errors
    ///
    /// Same conditions as [`set_read_deadline`](Conn::set_read_deadline).
    fn set_write_deadline(&self, deadline: Instant) -> Result<(), EngineError>;

    /// Gate new reads and writes with [`EngineError::Paused`].
    ///
    /// # Errors
    ///
    /// Streaming transports return [`EngineError::PauseNotSupported`]; the
    /// upgrade then skips the drain step.
    fn pause(&self) -> Result<(), EngineError>;

    /// Clear the pause gate.
    fn resume(&self);

    /// Atomically drain packets queued for emission. Empty for streaming
    /// transports.
    fn flush_out(&self) -> Vec<Packet>;

    /// Atomically drain packets received but not yet consumed. Empty for
    /// streaming transports.
    fn flush_in(&self) -> Vec<Packet>;

    /// Close the connection. Idempotent; subsequent reads and writes fail
    /// with [`EngineError::Closed`].
    fn close(&self) -> BoxFuture<'_, Result<(), EngineError>>;

    /// Downcast hook for the HTTP layer: the polling transport is driven
    /// directly by request handlers, streaming transports are not.
    fn as_polling(&self) -> Option<&polling::PollingConn> {
        None
    }
}
