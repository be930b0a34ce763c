//! The data-pipe seam between the engines and a concrete transport.
//!
//! The engines assume a reliable, ordered, message-oriented pipe that
//! carries binary frames and short text frames, exposes its outbound
//! buffer occupancy, and can signal when that buffer drains below a low
//! watermark. Inbound frames are delivered on an `mpsc` channel owned by
//! the engine; the channel closing is how an engine observes pipe loss.

use futures_util::future::BoxFuture;

/// A frame arriving from (or headed to) the data pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeFrame {
    Binary(Vec<u8>),
    Text(String),
}

/// Errors from transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
}

/// Outbound half of the data pipe.
///
/// `send_*` enqueue synchronously into the transport's outbound buffer;
/// [`buffer_low`](Transport::buffer_low) is the backpressure signal that
/// keeps that buffer bounded (the sliding window bounds what the *peer*
/// has not acknowledged; both tiers are needed).
pub trait Transport: Send {
    /// `true` while the pipe can accept frames.
    fn is_open(&self) -> bool;

    /// Bytes currently sitting in the outbound buffer.
    fn buffered_bytes(&self) -> usize;

    /// Queues a binary frame.
    fn send_binary(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Queues a text frame.
    fn send_text(&self, text: String) -> Result<(), TransportError>;

    /// Resolves once the outbound buffer has drained below the transport's
    /// low watermark. Must resolve immediately if it already has.
    fn buffer_low(&self) -> BoxFuture<'_, ()>;
}
