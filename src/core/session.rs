//! Session state and the registry that indexes it.
//!
//! A session is created by a valid `hello` and torn down by `goodbye`,
//! supersession, or the idle sweeper. UDP sessions carry packet crypto
//! material; WebSocket sessions do not. The registry keeps one writer lock
//! over three indexes so id, device, and nonce lookups always agree.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::RwLock;
use rand::RngCore;
use rand::rngs::OsRng;
use serde_json::Value;
use tokio::time::Instant;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::packet::{NONCE_LEN, PACKET_TYPE_AUDIO};

// ===== Session =====

/// Which transport a session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    WebSocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Udp => write!(f, "udp"),
            TransportKind::WebSocket => write!(f, "websocket"),
        }
    }
}

/// Per-session AES-128-CTR material, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionCrypto {
    pub key: [u8; 16],
    pub base_nonce: [u8; NONCE_LEN],
}

impl SessionCrypto {
    /// Generate fresh material. The first nonce byte is pinned to the audio
    /// packet type so the advertised nonce lines up with device headers.
    pub fn generate() -> Self {
        let mut key = [0u8; 16];
        let mut base_nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut base_nonce);
        base_nonce[0] = PACKET_TYPE_AUDIO;
        Self { key, base_nonce }
    }
}

impl fmt::Debug for SessionCrypto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCrypto").finish_non_exhaustive()
    }
}

/// 128-bit random session id, hex encoded.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Outcome of checking an inbound packet sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// Packet advanced (or repeated) the sequence. `gap` is set when the
    /// number was not exactly last + 1, which covers both loss and
    /// duplicates.
    Accepted { gap: bool, expected: u32 },
    /// Packet is older than one already accepted. State is unchanged.
    Stale { current: u32 },
}

/// State for one device connection on one transport.
#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    pub device_id: String,
    pub transport: TransportKind,
    pub crypto: Option<SessionCrypto>,
    /// Highest sequence number accepted from the device. Zero until the
    /// first packet, so devices must start at 1.
    pub remote_sequence: u32,
    /// Last sequence number used for server-originated packets.
    pub local_sequence: u32,
    /// Peer address learned from the most recent valid datagram.
    pub remote_addr: Option<SocketAddr>,
    pub iot_descriptors: Option<Value>,
    pub iot_states: Option<Value>,
    pub created_at: Instant,
    pub last_activity: Instant,
}

impl Session {
    pub fn new_udp(device_id: impl Into<String>) -> Self {
        Self::new_udp_with_crypto(device_id, SessionCrypto::generate())
    }

    /// UDP session around material generated by the caller, who usually
    /// needs the key and nonce for the hello acknowledgement.
    pub fn new_udp_with_crypto(device_id: impl Into<String>, crypto: SessionCrypto) -> Self {
        Self::new(device_id.into(), TransportKind::Udp, Some(crypto))
    }

    pub fn new_websocket(device_id: impl Into<String>) -> Self {
        Self::new(device_id.into(), TransportKind::WebSocket, None)
    }

    fn new(device_id: String, transport: TransportKind, crypto: Option<SessionCrypto>) -> Self {
        let now = Instant::now();
        Self {
            session_id: generate_session_id(),
            device_id,
            transport,
            crypto,
            remote_sequence: 0,
            local_sequence: 0,
            remote_addr: None,
            iot_descriptors: None,
            iot_states: None,
            created_at: now,
            last_activity: now,
        }
    }

    /// Check an inbound sequence number and advance the window unless the
    /// packet is stale.
    pub fn accept_sequence(&mut self, sequence: u32) -> SequenceOutcome {
        if sequence < self.remote_sequence {
            return SequenceOutcome::Stale {
                current: self.remote_sequence,
            };
        }
        let expected = self.remote_sequence.wrapping_add(1);
        self.remote_sequence = sequence;
        SequenceOutcome::Accepted {
            gap: sequence != expected,
            expected,
        }
    }

    /// Allocate the next sequence number for a server-originated packet.
    pub fn next_local_sequence(&mut self) -> u32 {
        self.local_sequence = self.local_sequence.wrapping_add(1);
        self.local_sequence
    }

    /// Record activity for idle tracking.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Update IoT snapshots, replacing only the fields that were sent.
    pub fn merge_iot(&mut self, descriptors: Option<Value>, states: Option<Value>) {
        if let Some(descriptors) = descriptors {
            self.iot_descriptors = Some(descriptors);
        }
        if let Some(states) = states {
            self.iot_states = Some(states);
        }
    }
}

// ===== Registry =====

#[derive(Default)]
struct Indexes {
    by_id: HashMap<String, Session>,
    by_nonce: HashMap<[u8; NONCE_LEN], String>,
    by_device: HashMap<(String, TransportKind), String>,
}

impl Indexes {
    fn detach(&mut self, session_id: &str) -> Option<Session> {
        let session = self.by_id.remove(session_id)?;
        if let Some(crypto) = &session.crypto {
            if self
                .by_nonce
                .get(&crypto.base_nonce)
                .is_some_and(|id| id == session_id)
            {
                self.by_nonce.remove(&crypto.base_nonce);
            }
        }
        let device_key = (session.device_id.clone(), session.transport);
        if self
            .by_device
            .get(&device_key)
            .is_some_and(|id| id == session_id)
        {
            self.by_device.remove(&device_key);
        }
        Some(session)
    }
}

/// Shared map of live sessions.
///
/// All mutation goes through closures executed under the registry lock, so
/// callers never hold a session reference across an await point.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<Indexes>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. An existing session for the same device and
    /// transport is superseded and returned so the caller can log it.
    pub fn insert(&self, session: Session) -> Option<Session> {
        let mut inner = self.inner.write();
        let superseded = inner
            .by_device
            .get(&(session.device_id.clone(), session.transport))
            .cloned()
            .and_then(|old_id| inner.detach(&old_id));

        if let Some(crypto) = &session.crypto {
            inner
                .by_nonce
                .insert(crypto.base_nonce, session.session_id.clone());
        }
        inner.by_device.insert(
            (session.device_id.clone(), session.transport),
            session.session_id.clone(),
        );
        inner.by_id.insert(session.session_id.clone(), session);
        superseded
    }

    /// Remove and return a session by id.
    pub fn remove(&self, session_id: &str) -> Option<Session> {
        self.inner.write().detach(session_id)
    }

    /// Run `f` against the session owning `nonce`, if any.
    pub fn with_session_by_nonce<R>(
        &self,
        nonce: &[u8; NONCE_LEN],
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.write();
        let session_id = inner.by_nonce.get(nonce)?.clone();
        inner.by_id.get_mut(&session_id).map(f)
    }

    /// Run `f` against a session by id, if it exists.
    pub fn with_session<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        self.inner.write().by_id.get_mut(session_id).map(f)
    }

    /// Run `f` against the device's session on the given transport.
    pub fn with_device_session<R>(
        &self,
        device_id: &str,
        transport: TransportKind,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.write();
        let session_id = inner
            .by_device
            .get(&(device_id.to_owned(), transport))?
            .clone();
        inner.by_id.get_mut(&session_id).map(f)
    }

    pub fn has_session(&self, device_id: &str, transport: TransportKind) -> bool {
        self.inner
            .read()
            .by_device
            .contains_key(&(device_id.to_owned(), transport))
    }

    /// Number of live sessions for a device across transports.
    pub fn device_session_count(&self, device_id: &str) -> usize {
        self.inner
            .read()
            .by_device
            .keys()
            .filter(|(device, _)| device == device_id)
            .count()
    }

    /// Session id to answer a device on, preferring UDP when both
    /// transports are live.
    pub fn primary_session_for_device(&self, device_id: &str) -> Option<String> {
        let inner = self.inner.read();
        inner
            .by_device
            .get(&(device_id.to_owned(), TransportKind::Udp))
            .or_else(|| {
                inner
                    .by_device
                    .get(&(device_id.to_owned(), TransportKind::WebSocket))
            })
            .cloned()
    }

    /// Remove every session idle longer than `timeout` and return them.
    pub fn remove_idle(&self, timeout: Duration) -> Vec<Session> {
        let mut inner = self.inner.write();
        let expired: Vec<String> = inner
            .by_id
            .values()
            .filter(|session| session.last_activity.elapsed() >= timeout)
            .map(|session| session.session_id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|session_id| inner.detach(session_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
