//! Envelopes on the signaling pipe.
//!
//! Inbound (client → server) messages route on an `action` field, but the
//! server also accepts `type` for tolerance with older clients; when both
//! are present, `type` wins. Outbound (server → client) messages always
//! use `type`. Relayed offer/answer/candidate/control messages are never
//! re-serialized; the server forwards the original text byte-for-byte,
//! so [`ClientEnvelope`] only extracts what routing needs.

use serde::{Deserialize, Serialize};

/// Routing kind of an inbound client message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Register,
    Join,
    Offer,
    Answer,
    Candidate,
    Control,
    /// Any routing key this server does not handle.
    Other,
}

impl ClientKind {
    fn from_key(key: &str) -> Self {
        match key {
            "register" => Self::Register,
            "join" => Self::Join,
            "offer" => Self::Offer,
            "answer" => Self::Answer,
            "candidate" => Self::Candidate,
            "control" => Self::Control,
            _ => Self::Other,
        }
    }
}

/// Partially parsed inbound message: routing key and PIN only.
#[derive(Debug, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    type_key: Option<String>,
    action: Option<String>,
    #[serde(default)]
    pub pin: Option<String>,
}

impl ClientEnvelope {
    /// Parses the envelope fields out of a raw text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// The routing kind, or `None` if neither `type` nor `action` is present.
    pub fn kind(&self) -> Option<ClientKind> {
        self.type_key
            .as_deref()
            .or(self.action.as_deref())
            .map(ClientKind::from_key)
    }
}

/// Error codes carried by `{type: "error"}` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PinInUse,
    InvalidPin,
    SessionFull,
    RateLimited,
    CapacityExceeded,
    MalformedMessage,
}

/// Server-originated signaling messages.
///
/// Relayed peer messages (offer/answer/candidate/control) are not listed:
/// they pass through as opaque text and keep whatever shape the peer sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Register { pin: String },
    PeerJoined,
    Joined,
    PeerLeft,
    Error { message: String, code: ErrorCode },
}

impl ServerMessage {
    /// Serializes to wire text. Infallible for these shapes in practice,
    /// but kept as a `Result` so callers stay on the `?` path.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
