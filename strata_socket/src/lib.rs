//! # strata_socket
//!
//! The application layer of the strata realtime messaging stack:
//! namespaces multiplexed over one engine session, typed events with
//! acknowledgments, and binary attachments.
//!
//! ```text
//! emit("/chat", "msg", args) ─► Packet ─► parser ─► engine MESSAGEs
//!                                                     │  text header
//!                                                     │  binary att. 0
//!                                                     └─ binary att. 1
//! engine MESSAGEs ─► decoder (reassembly) ─► dispatch ─► handler(args)
//!                                                     └─► ACK reply
//! ```
//!
//! Two interchangeable codecs implement the [`parser`] seam: the default
//! text codec (JSON body, binary arguments as placeholder objects plus
//! trailing attachments) and a binary schema codec (whole packet in one
//! frame, binary inline). Handlers are plain Rust closures over declared
//! parameter tuples; see [`handler`].

pub mod ack;
pub mod client;
pub mod error;
pub mod handler;
pub mod namespace;
pub mod packet;
pub mod parser;
pub mod server;
pub mod socket;

pub use ack::Ack;
pub use client::Client;
pub use error::{AckError, ArgsError, DispatchError, SocketError};
pub use handler::{Args, FromArg, FromArgs, Handler, IntoArg, IntoArgs, Json, Payload};
pub use namespace::Namespace;
pub use packet::{Arg, Packet, PacketData, PacketType};
pub use parser::{BinaryParser, Decoder, Encoder, Frame, Parser, TextParser};
pub use server::Server;
pub use socket::Socket;

pub use strata_engine::Options as EngineOptions;
