//! Acknowledgment bookkeeping.
//!
//! Emitting with an ack pre-registers a oneshot keyed by a fresh id; the
//! matching ACK packet resolves it exactly once and removes the entry. Ids
//! are monotonic per (session, namespace) and never reused. Detaching the
//! namespace or closing the session cancels whatever is still pending.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use async_lock::Mutex;
use futures::channel::oneshot;

use crate::{error::AckError, handler::Args};

/// Pending acknowledgments of one (session, namespace).
#[derive(Debug, Default)]
pub(crate) struct AckRegistry {
    counter: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Args>>>,
}

impl AckRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocate the next ack id. Ids start at 1 and are never reused.
    pub(crate) fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a waiter for `id` and return the future side.
    pub(crate) async fn register(&self, id: u64) -> Ack {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        Ack { rx }
    }

    /// Resolve `id` with the reply arguments. Unknown ids are a no-op and
    /// return `false`.
    pub(crate) async fn resolve(&self, id: u64, args: Args) -> bool {
        match self.pending.lock().await.remove(&id) {
            Some(waiting) => {
                if waiting.send(args).is_err() {
                    tracing::debug!(id, "ack waiter dropped before the reply arrived");
                }
                true
            }
            None => false,
        }
    }

    /// Drop every pending entry; their [`Ack`] futures resolve with
    /// [`AckError::Canceled`].
    pub(crate) async fn drop_all(&self) {
        self.pending.lock().await.clear();
    }

    #[cfg(test)]
    pub(crate) async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// A pending acknowledgment.
#[derive(Debug)]
pub struct Ack {
    rx: oneshot::Receiver<Args>,
}

impl Ack {
    /// Wait for the reply arguments.
    ///
    /// # Errors
    ///
    /// Resolves with [`AckError::Canceled`] when the namespace detached or
    /// the session closed before a reply arrived.
    pub async fn wait(self) -> Result<Args, AckError> {
        self.rx.await.map_err(|_| AckError::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Arg;

    #[tokio::test]
    async fn ids_are_monotonic_and_start_at_one() {
        let registry = AckRegistry::new();
        assert_eq!(registry.next_id(), 1);
        assert_eq!(registry.next_id(), 2);
        assert_eq!(registry.next_id(), 3);
    }

    #[tokio::test]
    async fn resolve_fires_exactly_once_and_removes_the_entry() {
        let registry = AckRegistry::new();
        let id = registry.next_id();
        let ack = registry.register(id).await;

        let args = Args::new(vec![Arg::Value("ok".into())]);
        assert!(registry.resolve(id, args.clone()).await);
        assert_eq!(registry.pending_len().await, 0);
        assert_eq!(ack.wait().await.expect("reply"), args);

        // Second resolve of the same id finds nothing.
        assert!(!registry.resolve(id, Args::default()).await);
    }

    #[tokio::test]
    async fn unknown_ids_are_dropped_silently() {
        let registry = AckRegistry::new();
        assert!(!registry.resolve(999, Args::default()).await);
    }

    #[tokio::test]
    async fn drop_all_cancels_waiters() {
        let registry = AckRegistry::new();
        let id = registry.next_id();
        let ack = registry.register(id).await;
        registry.drop_all().await;
        assert_eq!(ack.wait().await, Err(AckError::Canceled));
    }
}
