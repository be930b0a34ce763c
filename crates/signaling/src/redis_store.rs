//! Redis-backed session store.
//!
//! Key layout matches the memory store's semantics exactly: `pin:{PIN}`
//! is a hash with `senderConnId` / `receiverConnId` fields, and
//! `connection:{connId}` is a string holding the PIN. Atomicity of
//! create and join comes from `HSETNX`; TTLs are enforced by Redis.
//!
//! Connection parameters come from the environment: `REDIS_HOST` as
//! `host` or `host:port` (default `localhost:6379`) and an optional
//! `REDIS_PASSWORD`.

use std::collections::HashMap;
use std::time::Duration;

use redis::AsyncCommands;
use tracing::debug;

use crate::store::{JoinOutcome, SessionRecord, SessionStore, StoreError};

const PIN_KEY_PREFIX: &str = "pin:";
const CONN_KEY_PREFIX: &str = "connection:";
const FIELD_SENDER: &str = "senderConnId";
const FIELD_RECEIVER: &str = "receiverConnId";

fn pin_key(pin: &str) -> String {
    format!("{PIN_KEY_PREFIX}{pin}")
}

fn conn_key(conn_id: &str) -> String {
    format!("{CONN_KEY_PREFIX}{conn_id}")
}

fn to_store_err(e: redis::RedisError) -> StoreError {
    StoreError(e.to_string())
}

/// Builds a connection URL from `REDIS_HOST`-style values.
fn redis_url(host: &str, password: Option<&str>) -> Result<String, StoreError> {
    let (host, port) = match host.split_once(':') {
        Some((h, p)) => {
            let port: u16 = p
                .parse()
                .map_err(|_| StoreError(format!("invalid redis port: {p}")))?;
            (h, port)
        }
        None => (host, 6379),
    };
    Ok(match password {
        Some(pw) if !pw.is_empty() => format!("redis://:{pw}@{host}:{port}"),
        _ => format!("redis://{host}:{port}"),
    })
}

/// Session store backed by a shared Redis instance.
pub struct RedisStore {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(to_store_err)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(to_store_err)?;
        debug!("connected to redis");
        Ok(Self { conn })
    }

    /// Connects using `REDIS_HOST` / `REDIS_PASSWORD`.
    pub async fn connect_from_env() -> Result<Self, StoreError> {
        let host = std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".into());
        let password = std::env::var("REDIS_PASSWORD").ok();
        let url = redis_url(&host, password.as_deref())?;
        Self::connect(&url).await
    }
}

impl SessionStore for RedisStore {
    async fn try_create(
        &self,
        pin: &str,
        sender_conn_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let key = pin_key(pin);

        let created: bool = conn
            .hset_nx(&key, FIELD_SENDER, sender_conn_id)
            .await
            .map_err(to_store_err)?;
        if !created {
            return Ok(false);
        }

        let () = conn
            .expire(&key, ttl.as_secs() as i64)
            .await
            .map_err(to_store_err)?;
        let () = conn
            .set_ex(conn_key(sender_conn_id), pin, ttl.as_secs())
            .await
            .map_err(to_store_err)?;
        Ok(true)
    }

    async fn join(
        &self,
        pin: &str,
        receiver_conn_id: &str,
        ttl: Duration,
    ) -> Result<JoinOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let key = pin_key(pin);

        let exists: bool = conn.exists(&key).await.map_err(to_store_err)?;
        if !exists {
            return Ok(JoinOutcome::NotFound);
        }

        let paired: bool = conn
            .hset_nx(&key, FIELD_RECEIVER, receiver_conn_id)
            .await
            .map_err(to_store_err)?;
        if !paired {
            return Ok(JoinOutcome::AlreadyPaired);
        }

        let ttl_secs = ttl.as_secs();
        let () = conn
            .expire(&key, ttl_secs as i64)
            .await
            .map_err(to_store_err)?;
        let () = conn
            .set_ex(conn_key(receiver_conn_id), pin, ttl_secs)
            .await
            .map_err(to_store_err)?;

        // Keep the sender's reverse mapping alive as long as the session.
        let sender: Option<String> = conn.hget(&key, FIELD_SENDER).await.map_err(to_store_err)?;
        if let Some(sender) = sender {
            let () = conn
                .expire(conn_key(&sender), ttl_secs as i64)
                .await
                .map_err(to_store_err)?;
        }
        Ok(JoinOutcome::Joined)
    }

    async fn get_session(&self, pin: &str) -> Result<Option<SessionRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(pin_key(pin))
            .await
            .map_err(to_store_err)?;
        if fields.is_empty() {
            return Ok(None);
        }
        let Some(sender_conn_id) = fields.get(FIELD_SENDER).cloned() else {
            return Ok(None);
        };
        Ok(Some(SessionRecord {
            sender_conn_id,
            receiver_conn_id: fields.get(FIELD_RECEIVER).cloned(),
        }))
    }

    async fn pin_for_connection(&self, conn_id: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get(conn_key(conn_id)).await.map_err(to_store_err)
    }

    async fn remove_session(&self, pin: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = pin_key(pin);

        let fields: HashMap<String, String> = conn.hgetall(&key).await.map_err(to_store_err)?;
        if let Some(sender) = fields.get(FIELD_SENDER) {
            let () = conn.del(conn_key(sender)).await.map_err(to_store_err)?;
        }
        if let Some(receiver) = fields.get(FIELD_RECEIVER) {
            let () = conn.del(conn_key(receiver)).await.map_err(to_store_err)?;
        }
        let () = conn.del(&key).await.map_err(to_store_err)?;
        Ok(())
    }
}
