//! Tunables for the transfer engines.

use std::time::Duration;

use pindrop_protocol::CHUNK_SIZE;

/// Configuration shared by the sender and receiver engines.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Payload bytes per chunk. Only the final chunk may be shorter.
    pub chunk_size: usize,

    /// Upper bound on bytes sent but not yet acknowledged (8 MiB).
    pub max_outstanding_bytes: usize,

    /// Local transport backpressure: the sender waits for the outbound
    /// buffer to drain once it exceeds this many bytes (1 MiB).
    pub transport_low_watermark: usize,

    /// Receiver flushes ACKs once this many are buffered.
    pub ack_batch_size: usize,

    /// Period of the receiver's gap-detection timer.
    pub nack_timeout: Duration,

    /// At most this many missing indices per NACK message.
    pub nack_send_cap: usize,

    /// Skip NACKing entirely when this many (or more) chunks are missing;
    /// the transfer is still fresh and gap requests would be noise.
    pub nack_fresh_threshold: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            max_outstanding_bytes: 8 * 1024 * 1024,
            transport_low_watermark: 1024 * 1024,
            ack_batch_size: 4,
            nack_timeout: Duration::from_millis(2000),
            nack_send_cap: 20,
            nack_fresh_threshold: 100,
        }
    }
}

impl TransferConfig {
    /// Window bound in chunks, derived from the byte bound.
    ///
    /// Chunk-count accounting keeps every window operation O(1).
    pub fn max_chunks_in_flight(&self) -> usize {
        (self.max_outstanding_bytes / self.chunk_size).max(1)
    }
}
