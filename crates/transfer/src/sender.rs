//! Sender engine: streams a chunk source over the data pipe under the
//! sliding-window bound and resolves only when every chunk is acknowledged.
//!
//! The engine is one cooperative task. Each loop turn either services an
//! inbound control frame (ACK, NACK, pause/resume) or, when the window has
//! room, pushes the next chunk. Two backpressure tiers apply before every
//! send: the application window bounds what the receiver has not yet
//! acknowledged, and the transport low watermark bounds the local outbound
//! buffer. Cancellation is level-triggered: the flag is checked after
//! every suspension point.

use std::collections::HashSet;
use std::io;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use pindrop_protocol::control::{
    ControlAction, ControlError, ControlMessage, FileMeta, decode_control, encode_control,
};
use pindrop_protocol::frame::encode_chunk;

use crate::config::TransferConfig;
use crate::progress::{
    ProgressCallback, ProgressEmitter, SpeedCalculator, TransferProgress, TransferStatus,
};
use crate::source::ChunkSource;
use crate::transport::{PipeFrame, Transport};
use crate::window::SlidingWindow;

/// Errors from a send.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("data pipe is not open")]
    NotReady,

    #[error("transport closed")]
    TransportClosed,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("source read failed: {0}")]
    Read(#[from] io::Error),

    #[error(transparent)]
    Codec(#[from] ControlError),
}

/// What to announce in the `file-meta` message.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub name: String,
    pub mime_type: String,
    /// Optional whole-file checksum, verified by the receiver where it can.
    pub checksum: Option<String>,
}

/// Result of a completed send.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub bytes_sent: u64,
    pub total_chunks: u32,
    pub retransmitted_chunks: u64,
    pub elapsed: Duration,
}

enum Step {
    Cancelled,
    Inbound(Option<PipeFrame>),
    Space(Result<(), crate::window::WindowClosed>),
}

/// Mutable per-transfer state, separate from the engine's I/O handles so
/// handler methods can borrow both at once.
struct RunState {
    size: u64,
    total_chunks: u32,
    cursor: u32,
    sent_bytes: u64,
    retransmitted: u64,
    malformed_frames: u64,
    /// Indices the receiver already holds (resume); never sent.
    skip: HashSet<u32>,
    status: TransferStatus,
    emitter: ProgressEmitter,
    speed: SpeedCalculator,
}

impl RunState {
    fn snapshot(&self) -> TransferProgress {
        let percent = if self.size == 0 {
            100.0
        } else {
            self.sent_bytes as f64 / self.size as f64 * 100.0
        };
        TransferProgress {
            status: self.status,
            total_bytes: self.size,
            transferred_bytes: self.sent_bytes,
            percent,
            bytes_per_sec: self.speed.bytes_per_second(),
            error: None,
        }
    }

    fn fail(&mut self, error: &str) {
        self.status = TransferStatus::Failed;
        let mut progress = self.snapshot();
        progress.error = Some(error.to_string());
        self.emitter.emit_now(progress);
    }
}

/// Streams one file over the data pipe.
pub struct FileSender<T: Transport, S: ChunkSource> {
    transport: T,
    inbound: mpsc::Receiver<PipeFrame>,
    source: S,
    config: TransferConfig,
    cancel: CancellationToken,
    on_progress: Option<ProgressCallback>,
}

impl<T: Transport, S: ChunkSource> FileSender<T, S> {
    pub fn new(
        transport: T,
        inbound: mpsc::Receiver<PipeFrame>,
        source: S,
        config: TransferConfig,
    ) -> Self {
        Self {
            transport,
            inbound,
            source,
            config,
            cancel: CancellationToken::new(),
            on_progress: None,
        }
    }

    /// Handle the upper layer uses to cancel the transfer.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn on_progress(&mut self, callback: ProgressCallback) {
        self.on_progress = Some(callback);
    }

    /// Sends the source to completion.
    ///
    /// Resolves once the window has drained and every chunk is
    /// acknowledged, never at "last chunk sent", which would hide
    /// dropped-ACK bugs.
    pub async fn send(mut self, request: SendRequest) -> Result<SendOutcome, SendError> {
        if !self.transport.is_open() {
            return Err(SendError::NotReady);
        }

        let size = self.source.len();
        let total_chunks = size.div_ceil(self.config.chunk_size as u64) as u32;

        let mut state = RunState {
            size,
            total_chunks,
            cursor: 0,
            sent_bytes: 0,
            retransmitted: 0,
            malformed_frames: 0,
            skip: HashSet::new(),
            status: TransferStatus::Metadata,
            emitter: ProgressEmitter::new(self.on_progress.take()),
            speed: SpeedCalculator::new(),
        };

        state.emitter.emit_now(state.snapshot());
        let meta = ControlMessage::FileMeta(FileMeta {
            name: request.name,
            size,
            mime_type: request.mime_type,
            total_chunks,
            checksum: request.checksum,
        });
        self.transport
            .send_text(encode_control(&meta)?)
            .map_err(|_| SendError::TransportClosed)?;
        debug!(size, total_chunks, "file-meta sent");

        state.status = TransferStatus::Transferring;
        state.emitter.emit_now(state.snapshot());

        let window = SlidingWindow::new(self.config.max_outstanding_bytes, self.config.chunk_size);
        // The window opens on the receiver's `control.ready`, which follows
        // its `received-ranges` announcement, so a resuming receiver gets
        // its held ranges registered before the first chunk goes out.
        window.pause();
        let start = Instant::now();

        let result = self.run_loop(&window, &mut state).await;
        match &result {
            Ok(()) => {
                state.status = TransferStatus::Complete;
                state.emitter.emit_now(state.snapshot());
            }
            Err(SendError::Cancelled) => {
                window.clear();
            }
            Err(e) => {
                window.clear();
                state.fail(&e.to_string());
            }
        }
        result?;

        if state.malformed_frames > 0 {
            debug!(count = state.malformed_frames, "malformed frames dropped during transfer");
        }
        Ok(SendOutcome {
            bytes_sent: state.sent_bytes,
            total_chunks,
            retransmitted_chunks: state.retransmitted,
            elapsed: start.elapsed(),
        })
    }

    async fn run_loop(
        &mut self,
        window: &SlidingWindow,
        state: &mut RunState,
    ) -> Result<(), SendError> {
        loop {
            // Indices the receiver already holds count as delivered.
            while state.cursor < state.total_chunks && state.skip.contains(&state.cursor) {
                state.sent_bytes += chunk_len(state.cursor, state.size, self.config.chunk_size) as u64;
                state.cursor += 1;
            }

            if state.cursor >= state.total_chunks && window.stats().outstanding_chunks == 0 {
                return Ok(());
            }

            let step = if state.cursor < state.total_chunks {
                tokio::select! {
                    _ = self.cancel.cancelled() => Step::Cancelled,
                    frame = self.inbound.recv() => Step::Inbound(frame),
                    res = window.wait_for_space() => Step::Space(res),
                }
            } else {
                // Everything is on the wire; only ACKs (or cancellation)
                // can move the transfer forward.
                tokio::select! {
                    _ = self.cancel.cancelled() => Step::Cancelled,
                    frame = self.inbound.recv() => Step::Inbound(frame),
                }
            };

            match step {
                Step::Cancelled | Step::Space(Err(_)) => return Err(SendError::Cancelled),
                Step::Inbound(None) => return Err(SendError::TransportClosed),
                Step::Inbound(Some(frame)) => self.handle_frame(frame, window, state).await?,
                Step::Space(Ok(())) => self.push_next_chunk(window, state).await?,
            }
        }
    }

    /// Sends the chunk at the cursor, honouring the transport tier.
    async fn push_next_chunk(
        &mut self,
        window: &SlidingWindow,
        state: &mut RunState,
    ) -> Result<(), SendError> {
        self.drain_transport().await;
        self.check_cancelled()?;

        let index = state.cursor;
        let len = chunk_len(index, state.size, self.config.chunk_size);
        let payload = self
            .source
            .read_range(index as u64 * self.config.chunk_size as u64, len)
            .await?;
        self.check_cancelled()?;

        self.transport
            .send_binary(encode_chunk(index, &payload))
            .map_err(|_| SendError::TransportClosed)?;
        window.mark_sent(index, payload.len());

        state.cursor += 1;
        state.sent_bytes += payload.len() as u64;
        state.speed.add_sample(payload.len() as u64);
        state.emitter.emit(state.snapshot());
        Ok(())
    }

    async fn handle_frame(
        &mut self,
        frame: PipeFrame,
        window: &SlidingWindow,
        state: &mut RunState,
    ) -> Result<(), SendError> {
        let text = match frame {
            PipeFrame::Text(text) => text,
            PipeFrame::Binary(_) => {
                warn!("unexpected binary frame on sender side, dropping");
                return Ok(());
            }
        };

        let msg = match decode_control(&text) {
            Ok(msg) => msg,
            Err(e) => {
                state.malformed_frames += 1;
                warn!("dropping malformed control frame: {e}");
                return Ok(());
            }
        };

        match msg {
            ControlMessage::Ack { chunk_index } => {
                window.on_ack(chunk_index);
            }
            ControlMessage::Nack { missing_chunks } => {
                self.retransmit(&missing_chunks, window, state).await?;
            }
            ControlMessage::Control { action } => match action {
                ControlAction::Ready => window.resume(),
                ControlAction::Pause => {
                    window.pause();
                    state.status = TransferStatus::Paused;
                    state.emitter.emit_now(state.snapshot());
                }
                ControlAction::Resume => {
                    window.resume();
                    state.status = TransferStatus::Transferring;
                    state.emitter.emit_now(state.snapshot());
                }
            },
            ControlMessage::ReceivedRanges { ranges } => {
                for (range_start, range_end) in ranges {
                    for index in range_start..=range_end.min(state.total_chunks.saturating_sub(1)) {
                        state.skip.insert(index);
                    }
                }
                debug!(held = state.skip.len(), "receiver announced held ranges");
            }
            ControlMessage::TransferComplete { success, .. } => {
                // Informational; completion here is ACK-driven.
                debug!(success, "receiver reported transfer-complete");
            }
            ControlMessage::FileMeta(_) => {
                return Err(SendError::ProtocolViolation(
                    "file-meta received on sender side".into(),
                ));
            }
            ControlMessage::Unknown => {
                trace!("ignoring unknown control message");
            }
        }
        Ok(())
    }

    /// Resends explicitly requested chunks. Bypasses the window wait (the
    /// chunks are already accounted in flight) but still honours the
    /// transport tier.
    async fn retransmit(
        &mut self,
        missing: &[u32],
        window: &SlidingWindow,
        state: &mut RunState,
    ) -> Result<(), SendError> {
        let chunks = window.chunks_for_retransmit(missing);
        if chunks.is_empty() {
            // Stale request: everything was already acknowledged.
            return Ok(());
        }
        debug!(requested = missing.len(), resending = chunks.len(), "nack");

        for index in chunks {
            self.drain_transport().await;
            self.check_cancelled()?;

            let len = chunk_len(index, state.size, self.config.chunk_size);
            let payload = self
                .source
                .read_range(index as u64 * self.config.chunk_size as u64, len)
                .await?;
            self.transport
                .send_binary(encode_chunk(index, &payload))
                .map_err(|_| SendError::TransportClosed)?;
            state.retransmitted += 1;
        }
        Ok(())
    }

    /// Transport-tier backpressure: parks until the outbound buffer drops
    /// under the low watermark.
    async fn drain_transport(&self) {
        while self.transport.buffered_bytes() > self.config.transport_low_watermark {
            self.transport.buffer_low().await;
        }
    }

    fn check_cancelled(&self) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Cancelled);
        }
        Ok(())
    }
}

/// Payload length of chunk `index`: `chunk_size` except for a short tail.
fn chunk_len(index: u32, size: u64, chunk_size: usize) -> usize {
    let offset = index as u64 * chunk_size as u64;
    (size - offset).min(chunk_size as u64) as usize
}
