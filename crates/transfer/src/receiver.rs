//! Receiver engine: accepts chunk frames, tracks gaps, batches ACKs,
//! NACKs missing indices on a timer, and assembles the final artifact.
//!
//! Like the sender, the engine is one cooperative task selecting over the
//! inbound pipe, an upper-layer command channel (pause/resume/ranges), and
//! the NACK interval. Pausing only asks the sender to stop; chunks still
//! in flight are accepted normally.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use pindrop_protocol::control::{
    ControlAction, ControlError, ControlMessage, FileMeta, decode_control, encode_control,
};
use pindrop_protocol::frame::decode_chunk;

use crate::config::TransferConfig;
use crate::progress::{
    ProgressCallback, ProgressEmitter, SpeedCalculator, TransferProgress, TransferStatus,
};
use crate::ranges::ReceivedRanges;
use crate::sink::{SinkError, SinkOutput, WriteSink};
use crate::transport::{PipeFrame, Transport};

/// Errors from a receive.
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("transport closed")]
    TransportClosed,

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error(transparent)]
    Codec(#[from] ControlError),
}

/// Result of a completed receive.
#[derive(Debug)]
pub struct ReceiveOutcome {
    pub meta: FileMeta,
    pub bytes_received: u64,
    pub output: SinkOutput,
    pub elapsed: Duration,
}

/// Upper-layer requests into a running receiver.
enum ReceiverCommand {
    Pause,
    Resume,
    Ranges(oneshot::Sender<Vec<(u32, u32)>>),
}

/// Control handle for a running [`FileReceiver`].
#[derive(Clone)]
pub struct ReceiverHandle {
    commands: mpsc::Sender<ReceiverCommand>,
}

impl ReceiverHandle {
    /// Asks the sender to stop streaming. In-flight chunks still land.
    pub async fn pause(&self) {
        let _ = self.commands.send(ReceiverCommand::Pause).await;
    }

    pub async fn resume(&self) {
        let _ = self.commands.send(ReceiverCommand::Resume).await;
    }

    /// Snapshot of the received index ranges, for persisting across
    /// reconnects. `None` once the engine has finished.
    pub async fn received_ranges(&self) -> Option<Vec<(u32, u32)>> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(ReceiverCommand::Ranges(tx)).await.ok()?;
        rx.await.ok()
    }
}

/// State that exists only while a transfer is in progress.
struct ActiveTransfer {
    meta: FileMeta,
    tracker: ReceivedRanges,
    sink: WriteSink,
    received_bytes: u64,
    pending_acks: Vec<u32>,
    started: Instant,
    paused: bool,
    malformed_frames: u64,
}

enum Step {
    Frame(Option<PipeFrame>),
    Command(Option<ReceiverCommand>),
    NackTick,
}

/// Receives one file from the data pipe.
pub struct FileReceiver<T: Transport> {
    transport: T,
    inbound: mpsc::Receiver<PipeFrame>,
    commands: mpsc::Receiver<ReceiverCommand>,
    config: TransferConfig,
    output_path: Option<PathBuf>,
    resume_ranges: Option<Vec<(u32, u32)>>,
    on_progress: Option<ProgressCallback>,
}

impl<T: Transport> FileReceiver<T> {
    pub fn new(
        transport: T,
        inbound: mpsc::Receiver<PipeFrame>,
        config: TransferConfig,
    ) -> (Self, ReceiverHandle) {
        let (command_tx, command_rx) = mpsc::channel(8);
        (
            Self {
                transport,
                inbound,
                commands: command_rx,
                config,
                output_path: None,
                resume_ranges: None,
                on_progress: None,
            },
            ReceiverHandle {
                commands: command_tx,
            },
        )
    }

    /// Streams chunks to a seekable file at `path`. Without this (or if
    /// the file cannot be opened) chunks accumulate in memory instead.
    pub fn write_to(&mut self, path: impl Into<PathBuf>) {
        self.output_path = Some(path.into());
    }

    /// Seeds the tracker from a previous session's range snapshot; the
    /// ranges are announced to the sender after `file-meta` so it can skip
    /// what is already held.
    pub fn resume_from(&mut self, ranges: Vec<(u32, u32)>) {
        self.resume_ranges = Some(ranges);
    }

    pub fn on_progress(&mut self, callback: ProgressCallback) {
        self.on_progress = Some(callback);
    }

    /// Runs until the transfer completes or the pipe tears down.
    pub async fn run(mut self) -> Result<ReceiveOutcome, ReceiveError> {
        let mut emitter = ProgressEmitter::new(self.on_progress.take());
        let mut speed = SpeedCalculator::new();
        let mut active: Option<ActiveTransfer> = None;
        let mut commands_open = true;

        emitter.emit_now(TransferProgress {
            status: TransferStatus::AwaitingMeta,
            total_bytes: 0,
            transferred_bytes: 0,
            percent: 0.0,
            bytes_per_sec: 0.0,
            error: None,
        });

        let mut nack_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.nack_timeout,
            self.config.nack_timeout,
        );
        nack_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            let step = tokio::select! {
                frame = self.inbound.recv() => Step::Frame(frame),
                cmd = self.commands.recv(), if commands_open => Step::Command(cmd),
                _ = nack_timer.tick() => Step::NackTick,
            };

            match step {
                Step::Frame(None) => break Err(ReceiveError::TransportClosed),
                Step::Frame(Some(PipeFrame::Binary(data))) => {
                    match self.on_chunk(data, &mut active, &mut emitter, &mut speed).await {
                        Ok(Some(outcome)) => break Ok(outcome),
                        Ok(None) => {}
                        Err(e) => break Err(e),
                    }
                }
                Step::Frame(Some(PipeFrame::Text(text))) => {
                    match self.on_text(&text, &mut active, &mut emitter, &mut speed).await {
                        Ok(Some(outcome)) => break Ok(outcome),
                        Ok(None) => {}
                        Err(e) => break Err(e),
                    }
                }
                Step::Command(None) => commands_open = false,
                Step::Command(Some(cmd)) => {
                    if let Err(e) = self.on_command(cmd, &mut active, &mut emitter) {
                        break Err(e);
                    }
                }
                Step::NackTick => {
                    if let Err(e) = self.on_nack_tick(&mut active) {
                        break Err(e);
                    }
                }
            }
        };

        if let Err(e) = &result {
            // The partial sink (if any) is closed by drop, not deleted;
            // the upper layer decides what to do with it.
            let mut progress = active
                .as_ref()
                .map(|rx| Self::snapshot(rx, TransferStatus::Failed, &speed))
                .unwrap_or(TransferProgress {
                    status: TransferStatus::Failed,
                    total_bytes: 0,
                    transferred_bytes: 0,
                    percent: 0.0,
                    bytes_per_sec: 0.0,
                    error: None,
                });
            progress.error = Some(e.to_string());
            emitter.emit_now(progress);
        }
        result
    }

    fn snapshot(rx: &ActiveTransfer, status: TransferStatus, speed: &SpeedCalculator) -> TransferProgress {
        TransferProgress {
            status,
            total_bytes: rx.meta.size,
            transferred_bytes: rx.received_bytes,
            percent: rx.tracker.progress_percent(),
            bytes_per_sec: speed.bytes_per_second(),
            error: None,
        }
    }

    async fn on_text(
        &mut self,
        text: &str,
        active: &mut Option<ActiveTransfer>,
        emitter: &mut ProgressEmitter,
        speed: &mut SpeedCalculator,
    ) -> Result<Option<ReceiveOutcome>, ReceiveError> {
        let msg = match decode_control(text) {
            Ok(msg) => msg,
            Err(e) => {
                if let Some(rx) = active.as_mut() {
                    rx.malformed_frames += 1;
                }
                warn!("dropping malformed control frame: {e}");
                return Ok(None);
            }
        };

        match msg {
            ControlMessage::FileMeta(meta) => {
                if active.is_some() {
                    return Err(ReceiveError::ProtocolViolation(
                        "file-meta while a transfer is in progress".into(),
                    ));
                }
                self.start_transfer(meta, active, emitter).await?;
                // A zero-chunk file (or a complete resume snapshot) has
                // nothing left to receive.
                if active.as_ref().is_some_and(|rx| rx.tracker.is_complete()) {
                    let rx = active.take().unwrap();
                    return Ok(Some(self.finalise(rx, emitter, speed).await?));
                }
                Ok(None)
            }
            ControlMessage::Unknown => {
                trace!("ignoring unknown control message");
                Ok(None)
            }
            other => {
                debug!(?other, "unexpected control message on receiver side, dropping");
                Ok(None)
            }
        }
    }

    async fn start_transfer(
        &mut self,
        meta: FileMeta,
        active: &mut Option<ActiveTransfer>,
        emitter: &mut ProgressEmitter,
    ) -> Result<(), ReceiveError> {
        let resume_ranges = self.resume_ranges.take();

        let sink = match &self.output_path {
            Some(path) => {
                let opened = if resume_ranges.is_some() {
                    WriteSink::resume(path).await
                } else {
                    WriteSink::create(path).await
                };
                match opened {
                    Ok(sink) => sink,
                    Err(e) => {
                        warn!("seekable sink unavailable ({e}), falling back to memory");
                        WriteSink::memory()
                    }
                }
            }
            None => WriteSink::memory(),
        };

        // A resume snapshot is only honoured with a seekable sink: the
        // previously received chunks live in the partial file, which the
        // in-memory fallback cannot see.
        let tracker = match resume_ranges {
            Some(ranges) if sink.is_seekable() => {
                let tracker = ReceivedRanges::load_from_ranges(meta.total_chunks, &ranges);
                debug!(held = tracker.received_count(), "resuming from range snapshot");
                tracker
            }
            Some(_) => {
                warn!("resume snapshot dropped: no seekable sink to resume into");
                ReceivedRanges::new(meta.total_chunks)
            }
            None => ReceivedRanges::new(meta.total_chunks),
        };

        let received_bytes = held_bytes(&tracker, meta.size, self.config.chunk_size);

        // Announce held ranges before `ready` so the sender registers them
        // before it starts streaming. Both sends are best-effort: if the
        // pipe is already gone the inbound side will report it.
        if tracker.received_count() > 0 {
            let announce = ControlMessage::ReceivedRanges {
                ranges: tracker.ranges().to_vec(),
            };
            let _ = self.transport.send_text(encode_control(&announce)?);
        }

        let ready = ControlMessage::Control {
            action: ControlAction::Ready,
        };
        let _ = self.transport.send_text(encode_control(&ready)?);

        debug!(
            name = %meta.name,
            size = meta.size,
            total_chunks = meta.total_chunks,
            seekable = sink.is_seekable(),
            "transfer started"
        );

        let rx = ActiveTransfer {
            meta,
            tracker,
            sink,
            received_bytes,
            pending_acks: Vec::new(),
            started: Instant::now(),
            paused: false,
            malformed_frames: 0,
        };
        emitter.emit_now(TransferProgress {
            status: TransferStatus::Receiving,
            total_bytes: rx.meta.size,
            transferred_bytes: rx.received_bytes,
            percent: rx.tracker.progress_percent(),
            bytes_per_sec: 0.0,
            error: None,
        });
        *active = Some(rx);
        Ok(())
    }

    async fn on_chunk(
        &mut self,
        data: Vec<u8>,
        active: &mut Option<ActiveTransfer>,
        emitter: &mut ProgressEmitter,
        speed: &mut SpeedCalculator,
    ) -> Result<Option<ReceiveOutcome>, ReceiveError> {
        let Some(rx) = active.as_mut() else {
            warn!("binary chunk before file-meta, dropping");
            return Ok(None);
        };

        let (index, payload) = match decode_chunk(&data) {
            Ok(decoded) => decoded,
            Err(e) => {
                rx.malformed_frames += 1;
                warn!("dropping malformed chunk frame: {e}");
                return Ok(None);
            }
        };

        if index >= rx.meta.total_chunks {
            rx.malformed_frames += 1;
            warn!(index, total = rx.meta.total_chunks, "chunk index out of range, dropping");
            return Ok(None);
        }
        if rx.tracker.has_chunk(index) {
            trace!(index, "duplicate chunk, dropping");
            return Ok(None);
        }

        rx.sink
            .write_chunk(index, self.config.chunk_size, &payload)
            .await?;
        rx.tracker.mark_received(index);
        rx.received_bytes += payload.len() as u64;
        speed.add_sample(payload.len() as u64);

        rx.pending_acks.push(index);
        if rx.pending_acks.len() >= self.config.ack_batch_size {
            flush_acks(&self.transport, &mut rx.pending_acks)?;
        }

        let status = if rx.paused {
            TransferStatus::Paused
        } else {
            TransferStatus::Receiving
        };
        emitter.emit(Self::snapshot(rx, status, speed));

        if rx.tracker.is_complete() {
            let rx = active.take().unwrap();
            return Ok(Some(self.finalise(rx, emitter, speed).await?));
        }
        Ok(None)
    }

    async fn finalise(
        &mut self,
        mut rx: ActiveTransfer,
        emitter: &mut ProgressEmitter,
        speed: &mut SpeedCalculator,
    ) -> Result<ReceiveOutcome, ReceiveError> {
        emitter.emit_now(Self::snapshot(&rx, TransferStatus::Finalising, speed));
        flush_acks(&self.transport, &mut rx.pending_acks)?;

        let result = rx.sink.finalize(rx.meta.checksum.as_deref()).await;
        let success = result.is_ok();

        let complete = ControlMessage::TransferComplete {
            success,
            bytes_received: rx.received_bytes,
        };
        // Best-effort on the failure path; the error below carries the cause.
        let _ = self
            .transport
            .send_text(encode_control(&complete)?);

        let output = result?;
        if rx.malformed_frames > 0 {
            debug!(count = rx.malformed_frames, "malformed frames dropped during transfer");
        }
        emitter.emit_now(TransferProgress {
            status: TransferStatus::Complete,
            total_bytes: rx.meta.size,
            transferred_bytes: rx.received_bytes,
            percent: 100.0,
            bytes_per_sec: speed.bytes_per_second(),
            error: None,
        });

        Ok(ReceiveOutcome {
            meta: rx.meta,
            bytes_received: rx.received_bytes,
            output,
            elapsed: rx.started.elapsed(),
        })
    }

    fn on_command(
        &mut self,
        cmd: ReceiverCommand,
        active: &mut Option<ActiveTransfer>,
        emitter: &mut ProgressEmitter,
    ) -> Result<(), ReceiveError> {
        match cmd {
            ReceiverCommand::Pause => {
                let Some(rx) = active.as_mut() else {
                    debug!("pause with no active transfer, ignoring");
                    return Ok(());
                };
                if !rx.paused {
                    rx.paused = true;
                    let pause = ControlMessage::Control {
                        action: ControlAction::Pause,
                    };
                    self.transport
                        .send_text(encode_control(&pause)?)
                        .map_err(|_| ReceiveError::TransportClosed)?;
                    emitter.emit_now(TransferProgress {
                        status: TransferStatus::Paused,
                        total_bytes: rx.meta.size,
                        transferred_bytes: rx.received_bytes,
                        percent: rx.tracker.progress_percent(),
                        bytes_per_sec: 0.0,
                        error: None,
                    });
                }
            }
            ReceiverCommand::Resume => {
                let Some(rx) = active.as_mut() else {
                    debug!("resume with no active transfer, ignoring");
                    return Ok(());
                };
                if rx.paused {
                    rx.paused = false;
                    let resume = ControlMessage::Control {
                        action: ControlAction::Resume,
                    };
                    self.transport
                        .send_text(encode_control(&resume)?)
                        .map_err(|_| ReceiveError::TransportClosed)?;
                    emitter.emit_now(TransferProgress {
                        status: TransferStatus::Receiving,
                        total_bytes: rx.meta.size,
                        transferred_bytes: rx.received_bytes,
                        percent: rx.tracker.progress_percent(),
                        bytes_per_sec: 0.0,
                        error: None,
                    });
                }
            }
            ReceiverCommand::Ranges(reply) => {
                let ranges = active
                    .as_ref()
                    .map(|rx| rx.tracker.ranges().to_vec())
                    .unwrap_or_default();
                let _ = reply.send(ranges);
            }
        }
        Ok(())
    }

    /// Periodic gap check. Buffered ACKs that never reached a full batch
    /// ride the same tick so a stalled sender is not waiting on them.
    /// The gap request itself stays quiet when nothing is missing, when
    /// the transfer is so fresh that most chunks are still outstanding,
    /// or while paused (a NACK would undo the pause).
    fn on_nack_tick(&self, active: &mut Option<ActiveTransfer>) -> Result<(), ReceiveError> {
        let Some(rx) = active else {
            return Ok(());
        };
        if !rx.pending_acks.is_empty() {
            flush_acks(&self.transport, &mut rx.pending_acks)?;
        }
        if rx.paused || rx.tracker.is_complete() {
            return Ok(());
        }

        let missing = rx.tracker.missing_count();
        if missing == 0 || missing >= self.config.nack_fresh_threshold {
            return Ok(());
        }

        let request = rx.tracker.missing_prefix(self.config.nack_send_cap);
        debug!(missing, requesting = request.len(), "nack");
        let nack = ControlMessage::Nack {
            missing_chunks: request,
        };
        self.transport
            .send_text(encode_control(&nack)?)
            .map_err(|_| ReceiveError::TransportClosed)?;
        Ok(())
    }
}

/// Flushes buffered ACKs, one `ack` frame per index.
fn flush_acks<T: Transport>(
    transport: &T,
    pending: &mut Vec<u32>,
) -> Result<(), ReceiveError> {
    for index in pending.drain(..) {
        let ack = ControlMessage::Ack { chunk_index: index };
        transport
            .send_text(encode_control(&ack)?)
            .map_err(|_| ReceiveError::TransportClosed)?;
    }
    Ok(())
}

/// Bytes covered by the indices already in the tracker.
fn held_bytes(tracker: &ReceivedRanges, size: u64, chunk_size: usize) -> u64 {
    let mut bytes = 0u64;
    for &(range_start, range_end) in tracker.ranges() {
        for index in range_start..=range_end {
            let offset = index as u64 * chunk_size as u64;
            bytes += (size - offset).min(chunk_size as u64);
        }
    }
    bytes
}
