//! Binary chunk framing for the data pipe.
//!
//! Wire format: `[4 bytes BE: chunk index][4 bytes BE: payload length][payload]`.
//! Big-endian matches network order; the fixed 8-byte header keeps the hot
//! path alignment-friendly and avoids base64 inflation of raw payloads.

use crate::{CHUNK_SIZE, HEADER_SIZE};

/// Errors from binary frame decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short: {0} bytes (need at least {HEADER_SIZE})")]
    TooShort(usize),

    #[error("payload length mismatch: header declares {declared}, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("payload exceeds chunk size: {0} bytes")]
    Oversized(usize),
}

/// Encodes one chunk as a binary frame.
///
/// Allocates exactly `HEADER_SIZE + payload.len()` bytes.
pub fn encode_chunk(index: u32, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= CHUNK_SIZE);

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&index.to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Decodes a binary frame into `(chunk_index, payload)`.
///
/// The declared payload length must account for every byte after the
/// header; frames with trailing or missing bytes are rejected. The
/// returned payload is an owned copy and never aliases `frame`.
pub fn decode_chunk(frame: &[u8]) -> Result<(u32, Vec<u8>), FrameError> {
    if frame.len() < HEADER_SIZE {
        return Err(FrameError::TooShort(frame.len()));
    }

    let index = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    let declared = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;

    let actual = frame.len() - HEADER_SIZE;
    if declared != actual {
        return Err(FrameError::LengthMismatch { declared, actual });
    }
    if declared > CHUNK_SIZE {
        return Err(FrameError::Oversized(declared));
    }

    Ok((index, frame[HEADER_SIZE..].to_vec()))
}
