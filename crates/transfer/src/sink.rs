//! Write sinks: where received chunks land.
//!
//! The preferred path is a seekable file written at exact chunk offsets,
//! so chunks can arrive in any order without buffering. When no file sink
//! is available the receiver falls back to an in-memory map keyed by chunk
//! index, assembled in ascending order at finalise time.

use std::collections::BTreeMap;
use std::io::{self, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Errors from sink operations.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink write failed: {0}")]
    Write(#[source] io::Error),

    #[error("assembled checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

/// What finalising a sink produced.
#[derive(Debug)]
pub enum SinkOutput {
    /// Chunks were streamed to a file; it has been flushed and closed.
    File,
    /// Chunks were accumulated in memory; this is the assembled artifact.
    Assembled(Vec<u8>),
}

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// The receiver's write target.
pub enum WriteSink {
    Seekable { file: File },
    Memory { chunks: BTreeMap<u32, Vec<u8>> },
}

impl WriteSink {
    /// Opens a seekable file sink at `path`, truncating any previous content.
    pub async fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::create(path).await?;
        Ok(Self::Seekable { file })
    }

    /// Reopens a partial file for a resumed transfer, keeping the chunks a
    /// previous session already wrote.
    pub async fn resume(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .await?;
        Ok(Self::Seekable { file })
    }

    /// An in-memory fallback sink.
    pub fn memory() -> Self {
        Self::Memory {
            chunks: BTreeMap::new(),
        }
    }

    pub fn is_seekable(&self) -> bool {
        matches!(self, Self::Seekable { .. })
    }

    /// Persists one chunk at byte offset `index * chunk_size`.
    pub async fn write_chunk(
        &mut self,
        index: u32,
        chunk_size: usize,
        payload: &[u8],
    ) -> Result<(), SinkError> {
        match self {
            Self::Seekable { file } => {
                let offset = index as u64 * chunk_size as u64;
                file.seek(SeekFrom::Start(offset))
                    .await
                    .map_err(SinkError::Write)?;
                file.write_all(payload).await.map_err(SinkError::Write)?;
                Ok(())
            }
            Self::Memory { chunks } => {
                chunks.insert(index, payload.to_vec());
                Ok(())
            }
        }
    }

    /// Flushes and closes the sink.
    ///
    /// On the in-memory path the chunks are concatenated in ascending
    /// index order and, when `expected_checksum` is given, verified
    /// against it. A file sink is not re-read; the caller holds the
    /// expected checksum if it wants to verify out of band.
    pub async fn finalize(self, expected_checksum: Option<&str>) -> Result<SinkOutput, SinkError> {
        match self {
            Self::Seekable { mut file } => {
                file.flush().await.map_err(SinkError::Write)?;
                file.sync_all().await.map_err(SinkError::Write)?;
                Ok(SinkOutput::File)
            }
            Self::Memory { chunks } => {
                let mut assembled = Vec::with_capacity(chunks.values().map(Vec::len).sum());
                for payload in chunks.values() {
                    assembled.extend_from_slice(payload);
                }
                if let Some(expected) = expected_checksum {
                    let actual = checksum_bytes(&assembled);
                    if actual != expected {
                        return Err(SinkError::ChecksumMismatch {
                            expected: expected.to_string(),
                            actual,
                        });
                    }
                }
                Ok(SinkOutput::Assembled(assembled))
            }
        }
    }
}
