//! Application client facade.

use std::sync::Arc;

use crate::{
    ack::Ack,
    error::SocketError,
    handler::IntoArgs,
    namespace::{Namespace, Registry},
    parser::{Parser, TextParser, DEFAULT_DECODER_BUFFER},
    socket::Socket,
};

/// Application client: one engine session plus the namespace layer.
///
/// Connecting attaches the root namespace. Register handlers (via
/// [`of`](Client::of)) before emitting - an event that arrives for an
/// unregistered handler is dropped.
#[derive(Debug, Clone)]
pub struct Client {
    engine: strata_engine::Client,
    socket: Socket,
    registry: Arc<Registry>,
}

impl Client {
    /// Connect with the default text codec.
    ///
    /// # Errors
    ///
    /// Fails when the engine dial or handshake fails.
    pub async fn connect(url: &str) -> Result<Self, SocketError> {
        Self::connect_with(url, Arc::new(TextParser)).await
    }

    /// Connect with the given codec.
    ///
    /// # Errors
    ///
    /// Fails when the engine dial or handshake fails.
    pub async fn connect_with(url: &str, parser: Arc<dyn Parser>) -> Result<Self, SocketError> {
        let engine = strata_engine::Client::dial(url).await?;
        let registry = Arc::new(Registry::new());
        let socket = Socket::new(
            engine.socket().clone(),
            parser.as_ref(),
            registry.clone(),
            false,
            DEFAULT_DECODER_BUFFER,
        );

        let pump_socket = socket.clone();
        tokio::spawn(async move { pump_socket.pump().await });

        // Attach the root namespace; the server answers with a matching
        // CONNECT.
        socket.send_root_connect().await?;

        Ok(Self {
            engine,
            socket,
            registry,
        })
    }

    /// Session id assigned by the server.
    #[must_use]
    pub fn sid(&self) -> &str {
        self.socket.sid()
    }

    /// The handler table for a namespace, created lazily.
    pub async fn of(&self, namespace: &str) -> Arc<Namespace> {
        self.registry.get_or_create(namespace).await
    }

    /// The session's application socket.
    #[must_use]
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// The underlying engine client.
    #[must_use]
    pub fn engine(&self) -> &strata_engine::Client {
        &self.engine
    }

    /// Emit an event on the root namespace.
    ///
    /// # Errors
    ///
    /// Fails when an argument cannot be serialized or the session is
    /// closed.
    pub async fn emit<T: IntoArgs>(&self, event: &str, args: T) -> Result<(), SocketError> {
        self.socket.emit("/", event, args).await
    }

    /// Emit an event on the root namespace, expecting an acknowledgment.
    ///
    /// # Errors
    ///
    /// Same conditions as [`emit`](Client::emit).
    pub async fn emit_with_ack<T: IntoArgs>(
        &self,
        event: &str,
        args: T,
    ) -> Result<Ack, SocketError> {
        self.socket.emit_with_ack("/", event, args).await
    }

    /// Close the session. Idempotent.
    pub async fn close(&self) {
        self.engine.close().await;
        self.socket.close().await;
    }
}

