//! Per-session application socket: the namespace multiplexer.
//!
//! One [`Socket`] sits on one engine session and multiplexes every attached
//! namespace over it. Outbound, it encodes packets and feeds the resulting
//! engine messages into the session in order - the emit lock keeps a text
//! frame and its binary attachments contiguous. Inbound, the session's
//! MESSAGE events stream through the parser's decoder and each reassembled
//! packet is dispatched:
//!
//! | Packet        | Action                                                     |
//! |---------------|------------------------------------------------------------|
//! | CONNECT       | mark namespace attached, echo back (server), fire connect |
//! | DISCONNECT    | detach, drop pending acks, fire disconnect                 |
//! | EVENT         | look up handler, bind args, invoke; ack the reply if asked |
//! | ACK           | resolve the pending ack; unknown ids are dropped           |
//! | ERROR         | fire the namespace error callback                          |
//!
//! Dispatch is sequential per session: a slow handler stalls further
//! dispatch for its own session and nobody else's. Dispatch faults never
//! close the session.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_lock::{Mutex, RwLock};
use serde_json::Value;

use strata_engine::{Event, PacketKind};

use crate::{
    ack::{Ack, AckRegistry},
    error::{DispatchError, SocketError},
    handler::{Args, IntoArgs},
    namespace::Registry,
    packet::{normalize, Packet, PacketData, PacketType},
    parser::{Decoder, Encoder, Parser},
};

/// Per-session state of one namespace.
#[derive(Debug, Default)]
struct NspState {
    /// Has the peer CONNECT-ed (or confirmed our CONNECT) on this
    /// namespace.
    attached: AtomicBool,
    /// Whether our CONNECT is already on the wire.
    connect_sent: AtomicBool,
    acks: AckRegistry,
    /// Packets queued until the peer's CONNECT confirms the attachment.
    pending: Mutex<Vec<Packet>>,
}

struct Inner {
    engine: Arc<strata_engine::Socket>,
    encoder: Arc<dyn Encoder>,
    decoder: Arc<dyn Decoder>,
    registry: Arc<Registry>,
    states: RwLock<HashMap<String, Arc<NspState>>>,
    emit_lock: Mutex<()>,
    is_server: bool,
}

/// An application socket bound to one engine session.
///
/// Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<Inner>,
}

impl Socket {
    pub(crate) fn new(
        engine: Arc<strata_engine::Socket>,
        parser: &dyn Parser,
        registry: Arc<Registry>,
        is_server: bool,
        decoder_capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                encoder: parser.encoder(),
                decoder: parser.decoder(decoder_capacity),
                engine,
                registry,
                states: RwLock::new(HashMap::new()),
                emit_lock: Mutex::new(()),
                is_server,
            }),
        }
    }

    /// The engine session id.
    #[must_use]
    pub fn sid(&self) -> &str {
        self.inner.engine.sid()
    }

    /// The underlying engine session.
    #[must_use]
    pub fn engine(&self) -> &Arc<strata_engine::Socket> {
        &self.inner.engine
    }

    /// Emit an event on a namespace.
    ///
    /// The first traffic on a non-root namespace sends CONNECT first and
    /// queues the event until the peer confirms the attachment.
    ///
    /// # Errors
    ///
    /// Fails when an argument cannot be serialized or the session is
    /// closed.
    pub async fn emit<T: IntoArgs>(
        &self,
        namespace: &str,
        event: &str,
        args: T,
    ) -> Result<(), SocketError> {
        let packet = Packet::event(namespace, event, args.into_args()?);
        self.emit_packet(packet).await
    }

    /// Emit an event expecting an acknowledgment.
    ///
    /// # Errors
    ///
    /// Same conditions as [`emit`](Socket::emit).
    pub async fn emit_with_ack<T: IntoArgs>(
        &self,
        namespace: &str,
        event: &str,
        args: T,
    ) -> Result<Ack, SocketError> {
        let state = self.state(namespace).await;
        let id = state.acks.next_id();
        let ack = state.acks.register(id).await;

        let mut packet = Packet::event(namespace, event, args.into_args()?);
        packet.id = Some(id);
        self.emit_packet(packet).await?;
        Ok(ack)
    }

    /// Emit an ERROR packet on a namespace.
    ///
    /// # Errors
    ///
    /// Fails when the session is closed.
    pub async fn emit_error(&self, namespace: &str, data: Value) -> Result<(), SocketError> {
        self.emit_packet(Packet::error(namespace, data)).await
    }

    /// Detach from a namespace: tell the peer and drop local state,
    /// including pending acknowledgments.
    ///
    /// # Errors
    ///
    /// Fails when the session is closed.
    pub async fn disconnect(&self, namespace: &str) -> Result<(), SocketError> {
        let name = normalize(namespace);
        self.send_packet(Packet::disconnect(&name)).await?;
        let removed = self.inner.states.write().await.remove(&name);
        if let Some(state) = removed {
            state.acks.drop_all().await;
        }
        Ok(())
    }

    /// Close the session.
    pub async fn close(&self) {
        self.inner.engine.close().await;
        self.teardown().await;
    }

    /// Attach the root namespace (sent by the client right after dial).
    pub(crate) async fn send_root_connect(&self) -> Result<(), SocketError> {
        self.send_packet(Packet::connect("/")).await
    }

    async fn state(&self, namespace: &str) -> Arc<NspState> {
        let name = normalize(namespace);
        if let Some(state) = self.inner.states.read().await.get(&name) {
            return state.clone();
        }
        self.inner
            .states
            .write()
            .await
            .entry(name)
            .or_default()
            .clone()
    }

    /// Emit with the attachment gate: traffic on a not-yet-attached
    /// non-root namespace queues behind a CONNECT.
    async fn emit_packet(&self, packet: Packet) -> Result<(), SocketError> {
        if packet.namespace != "/" {
            let state = self.state(&packet.namespace).await;
            if !state.attached.load(Ordering::Acquire) {
                let namespace = packet.namespace.clone();
                let mut pending = state.pending.lock().await;
                // Re-check under the queue lock; the CONNECT confirmation
                // may have raced us here.
                if !state.attached.load(Ordering::Acquire) {
                    let need_connect = !state.connect_sent.swap(true, Ordering::AcqRel);
                    pending.push(packet);
                    drop(pending);
                    if need_connect {
                        self.send_packet(Packet::connect(&namespace)).await?;
                    }
                    return Ok(());
                }
            }
        }
        self.send_packet(packet).await
    }

    /// Encode and hand to the engine. The emit lock keeps one packet's
    /// frames (text header + attachments) contiguous in the outbox.
    async fn send_packet(&self, packet: Packet) -> Result<(), SocketError> {
        let _guard = self.inner.emit_lock.lock().await;
        let frames = self.inner.encoder.encode(packet)?;
        for frame in frames {
            self.inner
                .engine
                .emit(PacketKind::Message, frame.kind, frame.data)
                .await?;
        }
        Ok(())
    }

    /// Drive the session: feed MESSAGE events through the decoder and
    /// dispatch every reassembled packet, in receive order. Returns when
    /// the session closes.
    pub(crate) async fn pump(&self) {
        let events = self.inner.engine.events();
        let decoded = self.inner.decoder.decoded();
        while let Ok(event) = events.recv().await {
            match event {
                Event::Message(kind, data) => {
                    if let Err(e) = self.inner.decoder.add(kind, data).await {
                        tracing::debug!(sid = %self.sid(), "decode: {e}");
                        self.fire_error("/", Value::String(e.to_string())).await;
                    }
                    while let Ok(packet) = decoded.try_recv() {
                        self.dispatch(packet).await;
                    }
                }
                Event::Close => break,
                Event::Ping(_) | Event::Pong(_) | Event::Upgrade => {}
            }
        }
        self.teardown().await;
    }

    /// Drop all per-namespace state; pending acks resolve canceled, and
    /// attached namespaces fire their disconnect callback.
    async fn teardown(&self) {
        let states: Vec<(String, Arc<NspState>)> =
            self.inner.states.write().await.drain().collect();
        for (name, state) in states {
            state.acks.drop_all().await;
            if state.attached.load(Ordering::Acquire) {
                if let Some(namespace) = self.inner.registry.get(&name).await {
                    namespace.fire_disconnect(self.clone()).await;
                }
            }
        }
    }

    pub(crate) async fn dispatch(&self, packet: Packet) {
        tracing::debug!(sid = %self.sid(), kind = %packet.kind, namespace = %packet.namespace, "dispatch");
        match packet.kind {
            PacketType::Connect => self.dispatch_connect(&packet.namespace).await,
            PacketType::Disconnect => self.dispatch_disconnect(&packet.namespace).await,
            PacketType::Event | PacketType::BinaryEvent => self.dispatch_event(packet).await,
            PacketType::Ack | PacketType::BinaryAck => self.dispatch_ack(packet).await,
            PacketType::Error => {
                let data = match packet.data {
                    PacketData::Scalar(value) => value,
                    PacketData::None => Value::Null,
                    PacketData::Args(args) => Value::Array(
                        args.into_iter()
                            .filter_map(|arg| arg.as_value().cloned())
                            .collect(),
                    ),
                };
                self.fire_error(&packet.namespace, data).await;
            }
        }
    }

    async fn dispatch_connect(&self, namespace: &str) {
        let state = self.state(namespace).await;
        let first = !state.attached.swap(true, Ordering::AcqRel);

        if self.inner.is_server && first {
            if let Err(e) = self.send_packet(Packet::connect(namespace)).await {
                tracing::debug!(sid = %self.sid(), "connect echo: {e}");
            }
        }

        // Release whatever waited for the attachment, in order.
        let queued: Vec<Packet> = std::mem::take(&mut *state.pending.lock().await);
        for packet in queued {
            if let Err(e) = self.send_packet(packet).await {
                tracing::debug!(sid = %self.sid(), "flush queued: {e}");
            }
        }

        if first {
            if let Some(handlers) = self.inner.registry.get(&normalize(namespace)).await {
                handlers.fire_connect(self.clone()).await;
            }
        }
    }

    async fn dispatch_disconnect(&self, namespace: &str) {
        let removed = self.inner.states.write().await.remove(&normalize(namespace));
        if let Some(state) = removed {
            state.acks.drop_all().await;
        }
        if let Some(handlers) = self.inner.registry.get(&normalize(namespace)).await {
            handlers.fire_disconnect(self.clone()).await;
        }
    }

    async fn dispatch_event(&self, packet: Packet) {
        let namespace = packet.namespace.clone();
        let id = packet.id;

        let PacketData::Args(mut all) = packet.data else {
            self.fire_error(&namespace, Value::String(DispatchError::UnknownPacket.to_string()))
                .await;
            return;
        };
        if all.is_empty() {
            self.fire_error(&namespace, Value::String(DispatchError::UnknownPacket.to_string()))
                .await;
            return;
        }
        let event = match all.remove(0).as_value().and_then(Value::as_str) {
            Some(event) => event.to_owned(),
            None => {
                self.fire_error(
                    &namespace,
                    Value::String(DispatchError::UnknownPacket.to_string()),
                )
                .await;
                return;
            }
        };

        let Some(handlers) = self.inner.registry.get(&namespace).await else {
            tracing::debug!(sid = %self.sid(), namespace = %namespace, event = %event, "no namespace registered");
            return;
        };
        let Some(handler) = handlers.handler(&event).await else {
            tracing::debug!(sid = %self.sid(), namespace = %namespace, event = %event, "no handler registered");
            return;
        };

        match handler.call(self.clone(), Args::new(all)).await {
            Ok(values) => {
                if let Some(id) = id {
                    if let Err(e) = self.send_packet(Packet::ack(&namespace, id, values)).await {
                        tracing::debug!(sid = %self.sid(), "ack reply: {e}");
                    }
                }
            }
            Err(e) => {
                tracing::debug!(sid = %self.sid(), namespace = %namespace, event = %event, "dispatch: {e}");
                handlers
                    .fire_error(self.clone(), Value::String(e.to_string()))
                    .await;
            }
        }
    }

    async fn dispatch_ack(&self, packet: Packet) {
        let Some(id) = packet.id else {
            tracing::debug!(sid = %self.sid(), "ack without id");
            return;
        };
        let args = match packet.data {
            PacketData::Args(args) => Args::new(args),
            _ => Args::default(),
        };
        let state = self.state(&packet.namespace).await;
        if !state.acks.resolve(id, args).await {
            tracing::debug!(sid = %self.sid(), id, "unmatched ack id");
        }
    }

    async fn fire_error(&self, namespace: &str, data: Value) {
        if let Some(handlers) = self.inner.registry.get(&normalize(namespace)).await {
            handlers.fire_error(self.clone(), data).await;
        } else {
            tracing::debug!(sid = %self.sid(), namespace = %namespace, "unhandled error: {data}");
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("sid", &self.sid())
            .field("is_server", &self.inner.is_server)
            .finish_non_exhaustive()
    }
}
