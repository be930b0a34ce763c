//! Wire formats shared by the pindrop sender, receiver, and signaling server.
//!
//! The data pipe carries two disjoint frame shapes: binary chunk frames
//! (see [`frame`]) and JSON control messages tagged by a `type` field
//! (see [`control`]). The signaling pipe carries the envelopes in
//! [`signaling`]. PIN format rules live in [`pin`] so that both the
//! registry and client-side input handling agree on them.

pub mod control;
pub mod frame;
pub mod pin;
pub mod signaling;

pub use control::{ControlAction, ControlError, ControlMessage, FileMeta};
pub use frame::{FrameError, decode_chunk, encode_chunk};
pub use signaling::{ClientEnvelope, ClientKind, ErrorCode, ServerMessage};

/// Payload bytes carried by one full chunk frame (64 KiB).
pub const CHUNK_SIZE: usize = 65_536;

/// Fixed binary frame header: u32 chunk index + u32 payload length.
pub const HEADER_SIZE: usize = 8;
