//! Ping-session store: outstanding incoming Pings.
//!
//! Populated when the receive engine opens a valid Ping; consulted when
//! building the Pong and when correlating the arriving payload. Entries
//! are mirrored to the database so session material survives restarts,
//! and evicted on completion or after the 7-day window.
//!
//! The map is written only by the receive engine and read from both
//! engines under a short mutex; no await happens while it is held.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::network::transport::ConnId;
use crate::protocol::wire::PingId;
use crate::protocol::ContactId;
use crate::storage::{self, sessions as durable, Store};

/// One outstanding incoming Ping.
#[derive(Clone)]
pub struct PingSession {
    pub ping_id: PingId,
    pub contact_id: ContactId,
    pub sender_x25519: [u8; 32],
    /// Sender-declared creation time of the Ping.
    pub timestamp_ms: i64,
    /// Original encrypted Ping bytes (canonical form).
    pub wire_bytes: Vec<u8>,
    pub session_key: [u8; 32],
    pub received_ms: i64,
    /// The inbound connection the Ping arrived on, while still parked.
    pub conn_id: Option<ConnId>,
}

pub struct PingSessionStore {
    inner: Mutex<HashMap<String, PingSession>>,
    durable: Option<Arc<Store>>,
}

impl PingSessionStore {
    pub fn new(durable: Option<Arc<Store>>) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            durable,
        }
    }

    /// Rehydrate from the database after a restart. Session keys are
    /// re-derived by the receive engine when the cached wire is reopened,
    /// so persisted rows carry everything except the key and connection.
    pub fn load_persisted(&self, rows: Vec<durable::SessionRow>) {
        let mut inner = self.lock();
        for row in rows {
            inner.entry(row.ping_id.to_hex()).or_insert(PingSession {
                ping_id: row.ping_id,
                contact_id: row.contact_id,
                sender_x25519: row.sender_x25519,
                timestamp_ms: row.timestamp_ms,
                wire_bytes: BASE64.decode(&row.wire_b64).unwrap_or_default(),
                session_key: [0u8; 32],
                received_ms: row.received_ms,
                conn_id: None,
            });
        }
    }

    pub fn insert(&self, session: PingSession) {
        if let Some(store) = &self.durable {
            let row = durable::SessionRow {
                ping_id: session.ping_id,
                contact_id: session.contact_id,
                sender_x25519: session.sender_x25519,
                timestamp_ms: session.timestamp_ms,
                wire_b64: BASE64.encode(&session.wire_bytes),
                received_ms: session.received_ms,
            };
            if let Err(e) = durable::save(store, &row) {
                log::warn!("failed to persist ping session {}: {e}", session.ping_id);
            }
        }
        self.lock().insert(session.ping_id.to_hex(), session);
    }

    pub fn get(&self, ping_id: &PingId) -> Option<PingSession> {
        self.lock().get(&ping_id.to_hex()).cloned()
    }

    /// Detach and return the parked connection id, if the session still
    /// holds one. Ownership of the connection moves to the caller.
    pub fn take_conn(&self, ping_id: &PingId) -> Option<ConnId> {
        self.lock()
            .get_mut(&ping_id.to_hex())
            .and_then(|s| s.conn_id.take())
    }

    pub fn remove(&self, ping_id: &PingId) {
        self.lock().remove(&ping_id.to_hex());
        if let Some(store) = &self.durable {
            if let Err(e) = storage::sessions::delete(store, ping_id) {
                log::warn!("failed to delete persisted ping session {ping_id}: {e}");
            }
        }
    }

    /// Evict sessions older than `max_age_ms`. Returns how many went.
    pub fn cleanup_expired(&self, now_ms: i64, max_age_ms: i64) -> usize {
        let mut inner = self.lock();
        let before = inner.len();
        inner.retain(|_, s| now_ms - s.received_ms < max_age_ms);
        before - inner.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PingSession>> {
        self.inner.lock().expect("ping session lock poisoned")
    }
}
