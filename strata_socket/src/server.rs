//! Application server facade.
//!
//! Wires the engine server to the namespace layer: every engine session
//! that opens becomes an application [`Socket`], and a per-session pump
//! task feeds its MESSAGE stream through the parser into dispatch.
//! Handlers are registered per namespace and apply to every session.

use std::{collections::HashMap, sync::Arc};

use async_lock::RwLock;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{body::Incoming, Request, Response};
use tokio::net::TcpListener;

use crate::{
    namespace::{Namespace, Registry},
    parser::{Parser, TextParser, DEFAULT_DECODER_BUFFER},
    socket::Socket,
};

/// Application server.
///
/// Cheap to clone; clones share all state.
#[derive(Debug, Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    engine: strata_engine::Server,
    registry: Arc<Registry>,
    sockets: RwLock<HashMap<String, Socket>>,
}

impl Server {
    /// A server speaking the default text codec.
    #[must_use]
    pub fn new(options: strata_engine::Options) -> Self {
        Self::with_parser(options, Arc::new(TextParser))
    }

    /// A server speaking the given codec.
    #[must_use]
    pub fn with_parser(options: strata_engine::Options, parser: Arc<dyn Parser>) -> Self {
        let server = Self {
            inner: Arc::new(Inner {
                engine: strata_engine::Server::new(options),
                registry: Arc::new(Registry::new()),
                sockets: RwLock::new(HashMap::new()),
            }),
        };
        server.spawn_accept_loop(parser);
        server
    }

    /// The handler table for a namespace, created lazily. Handlers apply
    /// to every session.
    pub async fn of(&self, namespace: &str) -> Arc<Namespace> {
        self.inner.registry.get_or_create(namespace).await
    }

    /// The underlying engine server.
    #[must_use]
    pub fn engine(&self) -> &strata_engine::Server {
        &self.inner.engine
    }

    /// Look up a live session's socket.
    pub async fn socket(&self, sid: &str) -> Option<Socket> {
        self.inner.sockets.read().await.get(sid).cloned()
    }

    /// Number of live application sockets.
    pub async fn socket_count(&self) -> usize {
        self.inner.sockets.read().await.len()
    }

    /// Route one HTTP request (see the engine server for the query
    /// surface).
    pub async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        self.inner.engine.handle(req).await
    }

    /// Serve connections from a TCP listener until [`close`](Server::close).
    pub async fn serve(&self, listener: TcpListener) {
        self.inner.engine.serve(listener).await;
    }

    /// Shut down every session and stop accepting.
    pub async fn close(&self) {
        self.inner.engine.close().await;
        let sockets: Vec<Socket> = self.inner.sockets.write().await.drain().map(|(_, s)| s).collect();
        for socket in sockets {
            socket.close().await;
        }
    }

    fn spawn_accept_loop(&self, parser: Arc<dyn Parser>) {
        let server = self.clone();
        tokio::spawn(async move {
            while let Ok(engine_socket) = server.inner.engine.accept().await {
                let socket = Socket::new(
                    engine_socket,
                    parser.as_ref(),
                    server.inner.registry.clone(),
                    true,
                    DEFAULT_DECODER_BUFFER,
                );
                tracing::debug!(sid = %socket.sid(), "application session");
                server
                    .inner
                    .sockets
                    .write()
                    .await
                    .insert(socket.sid().to_owned(), socket.clone());

                let pump_server = server.clone();
                tokio::spawn(async move {
                    socket.pump().await;
                    pump_server.inner.sockets.write().await.remove(socket.sid());
                    tracing::debug!(sid = %socket.sid(), "application session ended");
                });
            }
        });
    }
}
