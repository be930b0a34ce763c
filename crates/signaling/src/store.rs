//! Session storage: the `pin:{PIN}` and `connection:{connId}` key families.
//!
//! A session is a hash keyed by PIN holding the sender's (and, once
//! paired, the receiver's) connection id, plus a reverse string mapping
//! from each connection id back to the PIN. Both families share one TTL;
//! an expired session is indistinguishable from an absent one.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A session as stored: who registered it and who (if anyone) joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub sender_conn_id: String,
    pub receiver_conn_id: Option<String>,
}

/// Backend failure (connection refused, protocol error, ...).
#[derive(Debug, thiserror::Error)]
#[error("session store error: {0}")]
pub struct StoreError(pub String);

/// Result of attempting to pair a receiver onto a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    NotFound,
    AlreadyPaired,
}

/// Key-value session storage with hash fields and TTL.
///
/// Per-PIN operations must appear atomic: create is create-if-absent,
/// join is a single conditional field write.
pub trait SessionStore: Send + Sync + 'static {
    /// Creates the session iff the PIN is unclaimed. Returns `false` on
    /// collision. Also writes the sender's reverse mapping.
    fn try_create(
        &self,
        pin: &str,
        sender_conn_id: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Pairs a receiver onto an existing session, refreshing the TTL on
    /// both key families, and writes the receiver's reverse mapping.
    fn join(
        &self,
        pin: &str,
        receiver_conn_id: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<JoinOutcome, StoreError>> + Send;

    fn get_session(
        &self,
        pin: &str,
    ) -> impl Future<Output = Result<Option<SessionRecord>, StoreError>> + Send;

    fn pin_for_connection(
        &self,
        conn_id: &str,
    ) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    /// Deletes the session hash and both reverse mappings. Idempotent.
    fn remove_session(&self, pin: &str) -> impl Future<Output = Result<(), StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

struct StoredSession {
    record: SessionRecord,
    expires_at: Instant,
}

struct StoredPin {
    pin: String,
    expires_at: Instant,
}

#[derive(Default)]
struct MemoryInner {
    sessions: HashMap<String, StoredSession>,
    connections: HashMap<String, StoredPin>,
}

/// Process-local store with lazy TTL expiry. The default for tests and
/// single-node deployments; Redis covers everything multi-node.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryInner {
    /// Drops the session under `pin` if its TTL has passed.
    fn purge_expired(&mut self, pin: &str) {
        let expired = self
            .sessions
            .get(pin)
            .is_some_and(|s| s.expires_at <= Instant::now());
        if expired {
            self.remove(pin);
        }
    }

    fn remove(&mut self, pin: &str) {
        if let Some(stored) = self.sessions.remove(pin) {
            self.connections.remove(&stored.record.sender_conn_id);
            if let Some(receiver) = &stored.record.receiver_conn_id {
                self.connections.remove(receiver);
            }
        }
    }
}

impl SessionStore for MemoryStore {
    async fn try_create(
        &self,
        pin: &str,
        sender_conn_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge_expired(pin);
        if inner.sessions.contains_key(pin) {
            return Ok(false);
        }

        let expires_at = Instant::now() + ttl;
        inner.sessions.insert(
            pin.to_string(),
            StoredSession {
                record: SessionRecord {
                    sender_conn_id: sender_conn_id.to_string(),
                    receiver_conn_id: None,
                },
                expires_at,
            },
        );
        inner.connections.insert(
            sender_conn_id.to_string(),
            StoredPin {
                pin: pin.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn join(
        &self,
        pin: &str,
        receiver_conn_id: &str,
        ttl: Duration,
    ) -> Result<JoinOutcome, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge_expired(pin);

        let expires_at = Instant::now() + ttl;
        let sender_conn_id = {
            let Some(stored) = inner.sessions.get_mut(pin) else {
                return Ok(JoinOutcome::NotFound);
            };
            if stored.record.receiver_conn_id.is_some() {
                return Ok(JoinOutcome::AlreadyPaired);
            }
            stored.record.receiver_conn_id = Some(receiver_conn_id.to_string());
            stored.expires_at = expires_at;
            stored.record.sender_conn_id.clone()
        };

        // Refresh both reverse mappings alongside the hash.
        if let Some(sender_entry) = inner.connections.get_mut(&sender_conn_id) {
            sender_entry.expires_at = expires_at;
        }
        inner.connections.insert(
            receiver_conn_id.to_string(),
            StoredPin {
                pin: pin.to_string(),
                expires_at,
            },
        );
        Ok(JoinOutcome::Joined)
    }

    async fn get_session(&self, pin: &str) -> Result<Option<SessionRecord>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge_expired(pin);
        Ok(inner.sessions.get(pin).map(|s| s.record.clone()))
    }

    async fn pin_for_connection(&self, conn_id: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .connections
            .get(conn_id)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.pin.clone()))
    }

    async fn remove_session(&self, pin: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.remove(pin);
        Ok(())
    }
}
