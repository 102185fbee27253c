//! Session identifiers and the sid → socket registry.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_lock::RwLock;
use rand::{rngs::OsRng, RngCore};

use crate::{socket::Socket, transport::Conn};

/// Base-32 alphabet for session ids: digits and upper-case letters minus
/// the ambiguous `I`, `L`, `O`, `U`.
const SID_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Bytes of raw id material: 6 bytes of millisecond timestamp followed by
/// cryptographic random.
const SID_BYTES: usize = 16;

/// Generate a fresh session id: time-prefixed so ids sort roughly by
/// creation, random-suffixed so they are unguessable. 26 characters.
#[must_use]
pub fn generate_sid() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64;

    let mut raw = [0u8; SID_BYTES];
    raw[..6].copy_from_slice(&now.to_be_bytes()[2..]);
    OsRng.fill_bytes(&mut raw[6..]);
    base32_encode(&raw)
}

/// Unpadded base-32 with the [`SID_ALPHABET`].
fn base32_encode(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len().div_ceil(5) * 8);
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    for &byte in input {
        acc = (acc << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            let index = (acc >> bits) & 0x1F;
            out.push(char::from(SID_ALPHABET[index as usize]));
        }
    }
    if bits > 0 {
        let index = (acc << (5 - bits)) & 0x1F;
        out.push(char::from(SID_ALPHABET[index as usize]));
    }
    out
}

/// In-memory registry of live sessions.
///
/// Lookup takes a single read lock; registration and removal take the write
/// lock. Removal is idempotent. Uniqueness of ids is by construction -
/// ids carry 80 bits of fresh randomness.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Socket>>>,
}

impl SessionManager {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create, register, and return a new session on `conn`.
    pub async fn create(
        &self,
        conn: Arc<dyn Conn>,
        transport: &'static str,
        read_timeout: Duration,
        write_timeout: Duration,
        outbox_capacity: usize,
    ) -> Arc<Socket> {
        let socket = Socket::new(
            conn,
            transport,
            generate_sid(),
            read_timeout,
            write_timeout,
            outbox_capacity,
        );
        self.sessions
            .write()
            .await
            .insert(socket.sid().to_owned(), socket.clone());
        socket
    }

    /// Look up a session by id.
    pub async fn get(&self, sid: &str) -> Option<Arc<Socket>> {
        self.sessions.read().await.get(sid).cloned()
    }

    /// Remove a session by id; a no-op when absent.
    pub async fn remove(&self, sid: &str) {
        self.sessions.write().await.remove(sid);
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no sessions are registered.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Snapshot of all live sessions, for shutdown.
    pub(crate) async fn drain(&self) -> Vec<Arc<Socket>> {
        self.sessions.write().await.drain().map(|(_, s)| s).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::polling::{PollingConn, DEFAULT_BUFFER};

    #[test]
    fn sids_are_26_chars_of_the_alphabet() {
        let sid = generate_sid();
        assert_eq!(sid.len(), 26);
        assert!(sid.bytes().all(|b| SID_ALPHABET.contains(&b)));
    }

    #[test]
    fn sids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(generate_sid()));
        }
    }

    #[test]
    fn sids_share_a_time_prefix_within_a_tick() {
        // The first 6 raw bytes (9 encoded chars + change) come from the
        // clock, so two ids generated back to back agree on the leading
        // characters.
        let a = generate_sid();
        let b = generate_sid();
        assert_eq!(&a[..6], &b[..6]);
    }

    #[test]
    fn base32_matches_known_vector() {
        // 0x0044 -> 00000 00001 00010 0(0000) -> "0120"
        assert_eq!(base32_encode(&[0x00, 0x44]), "0120");
        assert_eq!(base32_encode(&[]), "");
    }

    #[tokio::test]
    async fn registry_round_trip() {
        let manager = SessionManager::new();
        let conn = Arc::new(PollingConn::new(DEFAULT_BUFFER));
        let socket = manager
            .create(
                conn,
                "polling",
                Duration::from_secs(30),
                Duration::from_secs(5),
                8,
            )
            .await;

        let sid = socket.sid().to_owned();
        assert!(manager.get(&sid).await.is_some());
        assert!(manager.get("missing").await.is_none());

        manager.remove(&sid).await;
        assert!(manager.get(&sid).await.is_none());
        manager.remove(&sid).await; // idempotent
        assert!(manager.is_empty().await);
        socket.close().await;
    }
}
