//! PIN rendezvous service.
//!
//! A sender registers and gets a 6-character PIN; a receiver joins with
//! that PIN; from then on the server relays their handshake messages
//! verbatim without interpreting them. Sessions live in a key-value
//! store ([`MemoryStore`] or [`RedisStore`]) under a 10-minute TTL and
//! die with either peer's disconnect.

pub mod pin;
pub mod redis_store;
pub mod registry;
pub mod server;
pub mod store;

pub use pin::generate_pin;
pub use redis_store::RedisStore;
pub use registry::{Registry, RegistryError, SESSION_TTL};
pub use server::{MAX_SIGNALING_MESSAGE_SIZE, ServerConfig, ServerError, SignalingServer};
pub use store::{JoinOutcome, MemoryStore, SessionRecord, SessionStore, StoreError};
