//! Outbound event sink shared by the lifecycle, echo path, and turn processor.
//!
//! Everything a session sends goes through one unbounded channel drained by the
//! connection's writer task, so JSON events keep their emission order.

use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{error, trace};

use parley_core::frame::{PAYLOAD_TYPE_TTS, split_into_frames};
use parley_core::protocol::{ServerMessage, serialize_json};

/// A message waiting for the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Binary(Bytes),
}

#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Outbound>,
    framed: bool,
    created: Instant,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>, framed: bool) -> Self {
        Self {
            tx,
            framed,
            created: Instant::now(),
        }
    }

    /// Create a sink together with the receiver its writer drains.
    pub fn channel(framed: bool) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx, framed), rx)
    }

    /// Queue a JSON event. Returns `false` once the writer is gone.
    pub fn send(&self, message: &ServerMessage) -> bool {
        match serialize_json(message) {
            Ok(text) => {
                trace!(kind = message.kind(), "Queue outbound event");
                self.tx.send(Outbound::Text(text)).is_ok()
            }
            Err(e) => {
                error!(%e, kind = message.kind(), "Failed to serialize event");
                !self.is_closed()
            }
        }
    }

    /// Queue synthesized speech, frame-wrapped when framing is enabled.
    pub fn send_audio(&self, audio: &[u8]) -> bool {
        if !self.framed {
            return self.send_raw(Bytes::copy_from_slice(audio));
        }
        let timestamp = self.created.elapsed().as_millis() as u32;
        split_into_frames(timestamp, audio, PAYLOAD_TYPE_TTS)
            .into_iter()
            .all(|frame| self.send_raw(Bytes::from(frame)))
    }

    /// Queue a binary chunk as-is.
    pub fn send_raw(&self, chunk: Bytes) -> bool {
        self.tx.send(Outbound::Binary(chunk)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
