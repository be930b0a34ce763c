//! Sender-side sliding window: bounds chunks in flight, parks the sender
//! when the bound is reached, and wakes it as ACKs arrive.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::Notify;
use tracing::trace;

/// Returned by [`SlidingWindow::wait_for_space`] when the window has been
/// cleared; the waiter must not send.
#[derive(Debug, thiserror::Error)]
#[error("window cleared")]
pub struct WindowClosed;

/// Snapshot of window occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStats {
    pub outstanding_chunks: usize,
    pub outstanding_bytes: usize,
    pub paused: bool,
}

struct SentChunk {
    at: Instant,
    bytes: usize,
}

struct Inner {
    in_flight: HashMap<u32, SentChunk>,
    outstanding_bytes: usize,
    paused: bool,
    closed: bool,
}

/// Tracks chunks sent but not yet acknowledged.
///
/// The bound is chunk-count-based (`max_outstanding_bytes / chunk_size`)
/// so every operation stays O(1). Waiters park on a [`Notify`] and recheck
/// occupancy on wake; each ACK wakes at most as many waiters as slots it
/// freed, in FIFO order.
pub struct SlidingWindow {
    inner: Mutex<Inner>,
    space: Notify,
    max_chunks: usize,
}

impl SlidingWindow {
    pub fn new(max_outstanding_bytes: usize, chunk_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                in_flight: HashMap::new(),
                outstanding_bytes: 0,
                paused: false,
                closed: false,
            }),
            space: Notify::new(),
            max_chunks: (max_outstanding_bytes / chunk_size).max(1),
        }
    }

    /// `true` when not paused and a slot is free.
    pub fn can_send(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.closed && !inner.paused && inner.in_flight.len() < self.max_chunks
    }

    /// Records a chunk as in flight.
    ///
    /// # Panics
    ///
    /// Panics when called while [`can_send`](Self::can_send) is false;
    /// that is a caller bug, not a runtime condition.
    pub fn mark_sent(&self, index: u32, bytes: usize) {
        let mut inner = self.inner.lock().unwrap();
        assert!(
            !inner.closed && !inner.paused && inner.in_flight.len() < self.max_chunks,
            "mark_sent called on a full, paused, or cleared window"
        );
        let prev = inner.in_flight.insert(
            index,
            SentChunk {
                at: Instant::now(),
                bytes,
            },
        );
        debug_assert!(prev.is_none(), "chunk {index} marked sent twice");
        inner.outstanding_bytes += bytes;
    }

    /// Removes an acknowledged chunk. Returns `true` if it was in flight.
    pub fn on_ack(&self, index: u32) -> bool {
        self.on_ack_batch(std::slice::from_ref(&index)) == 1
    }

    /// Removes a batch of acknowledged chunks, then wakes as many parked
    /// waiters as slots were freed. Returns how many were in flight.
    pub fn on_ack_batch(&self, indices: &[u32]) -> usize {
        let freed = {
            let mut inner = self.inner.lock().unwrap();
            let mut freed = 0;
            for index in indices {
                if let Some(sent) = inner.in_flight.remove(index) {
                    inner.outstanding_bytes -= sent.bytes;
                    trace!(chunk = *index, rtt_ms = sent.at.elapsed().as_millis() as u64, "ack");
                    freed += 1;
                }
            }
            freed
        };
        for _ in 0..freed {
            self.space.notify_one();
        }
        freed
    }

    /// Completes when [`can_send`](Self::can_send) becomes true, or fails
    /// with [`WindowClosed`] once the window is cleared.
    ///
    /// Completes immediately if a slot is already free.
    pub async fn wait_for_space(&self) -> Result<(), WindowClosed> {
        loop {
            // Registered before the check; a wake landing between the
            // check and the await must not be lost.
            let notified = self.space.notified();
            {
                let inner = self.inner.lock().unwrap();
                if inner.closed {
                    return Err(WindowClosed);
                }
                if !inner.paused && inner.in_flight.len() < self.max_chunks {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Stops the sender from acquiring new slots until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.inner.lock().unwrap().paused = true;
    }

    /// Lifts a pause and wakes all parked waiters.
    pub fn resume(&self) {
        self.inner.lock().unwrap().paused = false;
        self.space.notify_waiters();
    }

    /// Intersects a NACK's missing list with the chunks actually in flight.
    ///
    /// Indices already acknowledged are dropped; the request is stale.
    pub fn chunks_for_retransmit(&self, missing: &[u32]) -> Vec<u32> {
        let inner = self.inner.lock().unwrap();
        missing
            .iter()
            .copied()
            .filter(|index| inner.in_flight.contains_key(index))
            .collect()
    }

    /// Drops all state and releases every waiter with [`WindowClosed`].
    pub fn clear(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.in_flight.clear();
            inner.outstanding_bytes = 0;
            inner.closed = true;
        }
        self.space.notify_waiters();
    }

    pub fn stats(&self) -> WindowStats {
        let inner = self.inner.lock().unwrap();
        WindowStats {
            outstanding_chunks: inner.in_flight.len(),
            outstanding_bytes: inner.outstanding_bytes,
            paused: inner.paused,
        }
    }
}
