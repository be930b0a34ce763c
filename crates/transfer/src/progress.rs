//! Progress reporting and transfer-speed estimation.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Lifecycle phase of a transfer, as surfaced to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Idle,
    Metadata,
    AwaitingMeta,
    Transferring,
    Receiving,
    Paused,
    Finalising,
    Complete,
    Failed,
}

/// Snapshot handed to progress callbacks.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub status: TransferStatus,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub percent: f64,
    pub bytes_per_sec: f64,
    pub error: Option<String>,
}

/// Callback invoked with transfer progress.
pub type ProgressCallback = Box<dyn Fn(TransferProgress) + Send + Sync>;

/// Average transfer speed over a sliding window of samples.
pub struct SpeedCalculator {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    max_samples: usize,
}

impl SpeedCalculator {
    /// Window defaults: 5 s of samples, at most 100 retained.
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(5), 100)
    }

    pub fn with_window(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
            max_samples,
        }
    }

    /// Records `bytes` transferred at the current instant.
    pub fn add_sample(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push_back((now, bytes));

        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    /// Average bytes/second across the window; 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let first = self.samples.front().unwrap().0;
        let last = self.samples.back().unwrap().0;
        let elapsed = last.duration_since(first);
        if elapsed.is_zero() {
            return 0.0;
        }
        let total: u64 = self.samples.iter().map(|&(_, bytes)| bytes).sum();
        total as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time to move `remaining` more bytes; `None` at zero speed.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Throttles progress callbacks: emits on a ≥2 % change, after 500 ms of
/// silence, or always for terminal states.
pub(crate) struct ProgressEmitter {
    callback: Option<ProgressCallback>,
    last_percent: f64,
    last_at: Instant,
}

impl ProgressEmitter {
    const MIN_DELTA_PCT: f64 = 2.0;
    const MIN_INTERVAL: Duration = Duration::from_millis(500);

    pub(crate) fn new(callback: Option<ProgressCallback>) -> Self {
        Self {
            callback,
            last_percent: f64::NEG_INFINITY,
            last_at: Instant::now(),
        }
    }

    /// Emits subject to throttling.
    pub(crate) fn emit(&mut self, progress: TransferProgress) {
        let terminal = matches!(
            progress.status,
            TransferStatus::Complete | TransferStatus::Failed
        );
        let due = terminal
            || (progress.percent - self.last_percent).abs() >= Self::MIN_DELTA_PCT
            || self.last_at.elapsed() >= Self::MIN_INTERVAL;
        if !due {
            return;
        }
        self.last_percent = progress.percent;
        self.last_at = Instant::now();
        if let Some(cb) = &self.callback {
            cb(progress);
        }
    }

    /// Emits unconditionally (state transitions, terminal events).
    pub(crate) fn emit_now(&mut self, progress: TransferProgress) {
        self.last_percent = progress.percent;
        self.last_at = Instant::now();
        if let Some(cb) = &self.callback {
            cb(progress);
        }
    }
}
