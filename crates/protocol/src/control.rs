//! Control messages exchanged as text frames on the data pipe.
//!
//! Every message is a compact JSON object discriminated by a `type` field.
//! Unknown `type` values deserialize to [`ControlMessage::Unknown`] so new
//! message kinds can be introduced without breaking older peers; a text
//! frame without a `type` field fails to decode.

use serde::{Deserialize, Serialize};

/// Errors from control message encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Transfer metadata announced before the first chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub total_chunks: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Flow-control action carried by a `control` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Ready,
    Pause,
    Resume,
}

/// A control message on the data pipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    FileMeta(FileMeta),

    #[serde(rename_all = "camelCase")]
    Ack { chunk_index: u32 },

    #[serde(rename_all = "camelCase")]
    Nack { missing_chunks: Vec<u32> },

    #[serde(rename_all = "camelCase")]
    TransferComplete { success: bool, bytes_received: u64 },

    /// Inclusive `[start, end]` index ranges already held by the receiver.
    ReceivedRanges { ranges: Vec<(u32, u32)> },

    Control { action: ControlAction },

    /// Forward compatibility: unrecognized `type` values land here and are
    /// ignored by both engines.
    #[serde(other)]
    Unknown,
}

/// Serializes a control message to its wire text.
pub fn encode_control(msg: &ControlMessage) -> Result<String, ControlError> {
    Ok(serde_json::to_string(msg)?)
}

/// Parses a text frame into a control message.
pub fn decode_control(text: &str) -> Result<ControlMessage, ControlError> {
    Ok(serde_json::from_str(text)?)
}
