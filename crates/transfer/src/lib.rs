//! Chunked file transfer over a reliable, ordered, message-oriented pipe.
//!
//! The sender splits a file into fixed-size chunks, streams them as binary
//! frames under a sliding-window bound, and resolves only when every chunk
//! has been acknowledged. The receiver tracks received indices, requests
//! gaps via NACKs, and assembles the chunks into a seekable file sink or
//! an in-memory map. Both engines are single-task cooperative loops: all
//! state is owned by one task and concurrency is expressed as suspension
//! points (`select!` over inbound frames, window space, and timers).

pub mod config;
pub mod progress;
pub mod ranges;
pub mod receiver;
pub mod sender;
pub mod sink;
pub mod source;
pub mod transport;
pub mod window;

pub use config::TransferConfig;
pub use progress::{ProgressCallback, SpeedCalculator, TransferProgress, TransferStatus};
pub use ranges::ReceivedRanges;
pub use receiver::{FileReceiver, ReceiveError, ReceiveOutcome, ReceiverHandle};
pub use sender::{FileSender, SendError, SendOutcome, SendRequest};
pub use sink::{SinkError, SinkOutput, WriteSink, checksum_bytes};
pub use source::{ChunkSource, FileSource, MemorySource};
pub use transport::{PipeFrame, Transport, TransportError};
pub use window::{SlidingWindow, WindowClosed, WindowStats};
