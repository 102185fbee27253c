//! Namespaces: per-path handler tables shared across sessions.
//!
//! A [`Namespace`] holds what the application registered for one path -
//! event handlers and the connect/disconnect/error callbacks. It is shared:
//! every session attached to `/chat` dispatches through the same table.
//! Per-session namespace state (the attached flag, the ack registry, the
//! queue of packets waiting for the peer's CONNECT) lives with the socket.
//!
//! Reads vastly outnumber writes here - dispatch looks handlers up on every
//! event, registration happens once at startup - hence the reader-writer
//! locks.

use std::{collections::HashMap, sync::Arc};

use async_lock::RwLock;
use serde_json::Value;

use crate::{
    handler::{AsyncFn, FromArgs, Handler, IntoArgs, SyncFn},
    packet::normalize,
    socket::Socket,
};

type Callback = Arc<dyn Fn(Socket) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(Socket, Value) + Send + Sync>;

/// Handler table for one namespace path.
pub struct Namespace {
    name: String,
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    on_connect: RwLock<Option<Callback>>,
    on_disconnect: RwLock<Option<Callback>>,
    on_error: RwLock<Option<ErrorCallback>>,
}

impl Namespace {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: normalize(name),
            handlers: RwLock::new(HashMap::new()),
            on_connect: RwLock::new(None),
            on_disconnect: RwLock::new(None),
            on_error: RwLock::new(None),
        }
    }

    /// The namespace path, `/`-rooted.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a handler for `event`.
    ///
    /// The handler receives the emitting socket and its declared parameter
    /// tuple; its return values become the ack reply when the event carries
    /// an id.
    pub async fn on<F, A, R>(&self, event: &str, handler: F)
    where
        F: Fn(Socket, A) -> R + Send + Sync + 'static,
        A: FromArgs + 'static,
        R: IntoArgs + 'static,
    {
        self.install(event, Arc::new(SyncFn::new(handler))).await;
    }

    /// Register an async handler for `event`.
    pub async fn on_async<F, A, Fut, R>(&self, event: &str, handler: F)
    where
        F: Fn(Socket, A) -> Fut + Send + Sync + 'static,
        A: FromArgs + 'static,
        Fut: std::future::Future<Output = R> + Send + 'static,
        R: IntoArgs + 'static,
    {
        self.install(event, Arc::new(AsyncFn::new(handler))).await;
    }

    /// Register a pre-built handler.
    pub async fn install(&self, event: &str, handler: Arc<dyn Handler>) {
        self.handlers
            .write()
            .await
            .insert(event.to_owned(), handler);
    }

    /// Callback fired when a session attaches to this namespace.
    pub async fn on_connect<F>(&self, callback: F)
    where
        F: Fn(Socket) + Send + Sync + 'static,
    {
        *self.on_connect.write().await = Some(Arc::new(callback));
    }

    /// Callback fired when a session detaches (or the session closes).
    pub async fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(Socket) + Send + Sync + 'static,
    {
        *self.on_disconnect.write().await = Some(Arc::new(callback));
    }

    /// Callback fired for ERROR packets and contained dispatch faults.
    pub async fn on_error<F>(&self, callback: F)
    where
        F: Fn(Socket, Value) + Send + Sync + 'static,
    {
        *self.on_error.write().await = Some(Arc::new(callback));
    }

    pub(crate) async fn handler(&self, event: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.read().await.get(event).cloned()
    }

    pub(crate) async fn fire_connect(&self, socket: Socket) {
        let callback = self.on_connect.read().await.clone();
        if let Some(callback) = callback {
            callback(socket);
        }
    }

    pub(crate) async fn fire_disconnect(&self, socket: Socket) {
        let callback = self.on_disconnect.read().await.clone();
        if let Some(callback) = callback {
            callback(socket);
        }
    }

    pub(crate) async fn fire_error(&self, socket: Socket, data: Value) {
        let callback = self.on_error.read().await.clone();
        match callback {
            Some(callback) => callback(socket, data),
            None => tracing::debug!(namespace = %self.name, "unhandled error: {data}"),
        }
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// All namespaces registered on one server or client.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    namespaces: RwLock<HashMap<String, Arc<Namespace>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fetch or lazily create the namespace for `name`.
    pub(crate) async fn get_or_create(&self, name: &str) -> Arc<Namespace> {
        let name = normalize(name);
        if let Some(namespace) = self.namespaces.read().await.get(&name) {
            return namespace.clone();
        }
        let mut namespaces = self.namespaces.write().await;
        namespaces
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Namespace::new(&name)))
            .clone()
    }

    pub(crate) async fn get(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces.read().await.get(name).cloned()
    }
}
