//! Shared test plumbing: an in-memory pipe end implementing [`Transport`]
//! plus small frame-inspection helpers.

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use pindrop_protocol::control::{ControlMessage, decode_control};
use pindrop_transfer::{PipeFrame, Transport, TransportError};

/// Outbound pipe end backed by a tokio channel. The paired
/// `mpsc::Receiver` plays the role of the peer's inbound stream.
pub struct ChannelTransport {
    tx: mpsc::Sender<PipeFrame>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::Sender<PipeFrame>) -> Self {
        Self { tx }
    }
}

impl Transport for ChannelTransport {
    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    fn buffered_bytes(&self) -> usize {
        0
    }

    fn send_binary(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        push(&self.tx, PipeFrame::Binary(frame))
    }

    fn send_text(&self, text: String) -> Result<(), TransportError> {
        push(&self.tx, PipeFrame::Text(text))
    }

    fn buffer_low(&self) -> BoxFuture<'_, ()> {
        Box::pin(std::future::ready(()))
    }
}

fn push(tx: &mpsc::Sender<PipeFrame>, frame: PipeFrame) -> Result<(), TransportError> {
    match tx.try_send(frame) {
        Ok(()) => Ok(()),
        Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
        Err(TrySendError::Full(_)) => panic!("test pipe overflow"),
    }
}

/// A transport feeding the returned receiver.
pub fn channel_pair() -> (ChannelTransport, mpsc::Receiver<PipeFrame>) {
    let (tx, rx) = mpsc::channel(4096);
    (ChannelTransport::new(tx), rx)
}

/// Deterministic pseudo-random payload.
pub fn test_bytes(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_4f6c_dd1du64;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            (state >> 33) as u8
        })
        .collect()
}

/// The chunk index of a binary frame, if `frame` is one.
pub fn chunk_index(frame: &PipeFrame) -> Option<u32> {
    match frame {
        PipeFrame::Binary(data) if data.len() >= 4 => {
            Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
        }
        _ => None,
    }
}

/// The acknowledged index, if `frame` is an `ack` control message.
pub fn ack_index(frame: &PipeFrame) -> Option<u32> {
    match frame {
        PipeFrame::Text(text) => match decode_control(text) {
            Ok(ControlMessage::Ack { chunk_index }) => Some(chunk_index),
            _ => None,
        },
        _ => None,
    }
}
