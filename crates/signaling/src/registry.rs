//! Session registry: PIN allocation, pairing, and join rate limiting on
//! top of a [`SessionStore`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::pin::generate_pin;
use crate::store::{JoinOutcome, SessionRecord, SessionStore, StoreError};

/// Sessions live this long without activity; a join refreshes the clock.
pub const SESSION_TTL: Duration = Duration::from_secs(600);

/// Collision retries before giving up on allocation.
const PIN_RETRY_BUDGET: usize = 8;

/// Failed joins from one connection before it is cooled off.
const MAX_FAILED_JOINS: u32 = 3;

/// Cooldown after too many failed joins.
const JOIN_COOLDOWN: Duration = Duration::from_secs(300);

/// Errors surfaced to the signaling handler.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("PIN format is invalid")]
    InvalidPin,

    #[error("no session under that PIN")]
    SessionNotFound,

    #[error("session already has a receiver")]
    SessionFull,

    #[error("cannot join a session you registered")]
    SelfJoin,

    #[error("could not allocate a unique PIN")]
    CapacityExceeded,

    #[error("too many failed attempts, try again later")]
    RateLimited,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Default)]
struct JoinAttempts {
    failures: u32,
    blocked_until: Option<Instant>,
}

/// PIN-keyed session registry.
pub struct Registry<S> {
    store: S,
    ttl: Duration,
    limiter: Mutex<HashMap<String, JoinAttempts>>,
}

impl<S: SessionStore> Registry<S> {
    pub fn new(store: S) -> Self {
        Self::with_ttl(store, SESSION_TTL)
    }

    pub fn with_ttl(store: S, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            limiter: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a fresh PIN for `sender_conn_id`.
    ///
    /// Collisions are retried internally, up to the retry budget; a
    /// caller never sees one. Past the budget the alphabet is effectively
    /// saturated and allocation fails.
    pub async fn create_session(&self, sender_conn_id: &str) -> Result<String, RegistryError> {
        for attempt in 0..PIN_RETRY_BUDGET {
            let pin = generate_pin();
            if self.store.try_create(&pin, sender_conn_id, self.ttl).await? {
                if attempt > 0 {
                    debug!(attempt, "pin allocated after collision");
                }
                return Ok(pin);
            }
        }
        Err(RegistryError::CapacityExceeded)
    }

    /// Pairs `receiver_conn_id` onto the session under `pin`.
    ///
    /// Returns the paired record so the caller can notify the sender.
    pub async fn join_session(
        &self,
        pin: &str,
        receiver_conn_id: &str,
    ) -> Result<SessionRecord, RegistryError> {
        self.check_rate_limit(receiver_conn_id)?;

        if !pindrop_protocol::pin::is_valid(pin) {
            self.record_failure(receiver_conn_id);
            return Err(RegistryError::InvalidPin);
        }

        match self.store.get_session(pin).await? {
            None => {
                self.record_failure(receiver_conn_id);
                return Err(RegistryError::SessionNotFound);
            }
            Some(record) if record.sender_conn_id == receiver_conn_id => {
                return Err(RegistryError::SelfJoin);
            }
            Some(_) => {}
        }

        match self.store.join(pin, receiver_conn_id, self.ttl).await? {
            JoinOutcome::NotFound => {
                self.record_failure(receiver_conn_id);
                Err(RegistryError::SessionNotFound)
            }
            JoinOutcome::AlreadyPaired => Err(RegistryError::SessionFull),
            JoinOutcome::Joined => {
                self.clear_failures(receiver_conn_id);
                self.store
                    .get_session(pin)
                    .await?
                    .ok_or(RegistryError::SessionNotFound)
            }
        }
    }

    pub async fn get_session(&self, pin: &str) -> Result<Option<SessionRecord>, RegistryError> {
        Ok(self.store.get_session(pin).await?)
    }

    pub async fn pin_for_connection(
        &self,
        conn_id: &str,
    ) -> Result<Option<String>, RegistryError> {
        Ok(self.store.pin_for_connection(conn_id).await?)
    }

    pub async fn remove_session(&self, pin: &str) -> Result<(), RegistryError> {
        Ok(self.store.remove_session(pin).await?)
    }

    /// Drops rate-limiter state for a connection that went away.
    pub fn forget_connection(&self, conn_id: &str) {
        self.limiter.lock().unwrap().remove(conn_id);
    }

    fn check_rate_limit(&self, conn_id: &str) -> Result<(), RegistryError> {
        let mut limiter = self.limiter.lock().unwrap();
        if let Some(attempts) = limiter.get_mut(conn_id) {
            if let Some(until) = attempts.blocked_until {
                if Instant::now() < until {
                    return Err(RegistryError::RateLimited);
                }
                attempts.blocked_until = None;
                attempts.failures = 0;
            }
        }
        Ok(())
    }

    fn record_failure(&self, conn_id: &str) {
        let mut limiter = self.limiter.lock().unwrap();
        let attempts = limiter.entry(conn_id.to_string()).or_default();
        attempts.failures += 1;
        if attempts.failures >= MAX_FAILED_JOINS {
            attempts.blocked_until = Some(Instant::now() + JOIN_COOLDOWN);
        }
    }

    fn clear_failures(&self, conn_id: &str) {
        self.limiter.lock().unwrap().remove(conn_id);
    }
}
