//! # strata_engine
//!
//! The session/transport layer of the strata realtime messaging stack: a
//! transport-agnostic bidirectional packet channel with session identity,
//! keep-alive, and live transport upgrade.
//!
//! A session starts on the long-polling transport - a virtual duplex
//! connection assembled from HTTP request/response pairs - and upgrades to
//! a websocket under traffic without losing or reordering packets:
//!
//! ```text
//! ┌────────┐  GET/POST /engine.io/?EIO=3&transport=polling   ┌────────┐
//! │ client  │ ───────────────────────────────────────────────► │ server  │
//! │         │  ws://…?EIO=3&transport=websocket&sid=…          │         │
//! │         │ ──── PING probe ──► PONG ──── UPGRADE ─────────► │         │
//! └────────┘        (old transport drained & swapped)          └────────┘
//! ```
//!
//! The layers stack as: framing codec ([`codec`]) under the transports
//! ([`transport`]), under the per-session socket ([`socket`]), under the
//! server/client facades ([`server`], [`client`]). MESSAGE packets are
//! opaque here; `strata_socket` gives them namespaces, events, and acks.

pub mod barrier;
pub mod client;
pub mod codec;
pub mod error;
pub mod packet;
pub mod server;
pub mod session;
pub mod socket;
pub mod transport;

pub use barrier::Barrier;
pub use client::Client;
pub use codec::{Framing, Payload};
pub use error::EngineError;
pub use packet::{MessageKind, Packet, PacketKind, Parameters};
pub use server::{Options, Server, PROTOCOL_VERSION};
pub use socket::{Event, Socket};
