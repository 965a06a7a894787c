//! Parley session wire protocol: JSON messages.
//!
//! Every JSON message is an object with a `type` discriminator. Binary audio
//! never travels as JSON; see [`crate::frame`] for the binary layouts.

use serde::{Deserialize, Serialize};

/// Client -> Server messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Mute or unmute inbound audio. Only the binary path reacts to it.
    #[serde(rename = "control.mute")]
    Mute { value: bool },

    /// Stop the turn currently being produced.
    #[serde(rename = "control.interrupt")]
    Interrupt {},

    /// Interim transcript; may start a speculative model run.
    #[serde(rename = "transcript_speculative")]
    TranscriptSpeculative {
        text: String,
        #[serde(rename = "turnId", default, skip_serializing_if = "Option::is_none")]
        turn_id: Option<String>,
    },

    /// End-of-turn transcript.
    #[serde(rename = "transcript_final")]
    TranscriptFinal {
        text: String,
        #[serde(rename = "turnId", default, skip_serializing_if = "Option::is_none")]
        turn_id: Option<String>,
    },
}

impl ClientMessage {
    /// Wire name of the message type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Mute { .. } => "control.mute",
            Self::Interrupt {} => "control.interrupt",
            Self::TranscriptSpeculative { .. } => "transcript_speculative",
            Self::TranscriptFinal { .. } => "transcript_final",
        }
    }
}

/// Connection lifecycle state reported in `state` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connected,
    Streaming,
    Closed,
}

/// Pipeline stage reported in `status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Thinking,
    Synthesizing,
}

/// Server -> Client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "state")]
    State { value: SessionState },

    #[serde(rename = "status")]
    Status { value: TurnStatus },

    #[serde(rename = "llm_partial")]
    LlmPartial {
        text: String,
        #[serde(rename = "turnId", default, skip_serializing_if = "Option::is_none")]
        turn_id: Option<String>,
    },

    #[serde(rename = "llm_complete")]
    LlmComplete {
        text: String,
        #[serde(rename = "turnId", default, skip_serializing_if = "Option::is_none")]
        turn_id: Option<String>,
    },

    #[serde(rename = "llm_error")]
    LlmError {
        reason: String,
        #[serde(rename = "turnId", default, skip_serializing_if = "Option::is_none")]
        turn_id: Option<String>,
    },

    /// Protocol-level rejection. The connection stays open.
    #[serde(rename = "error")]
    Error { reason: String },

    #[serde(rename = "benchmark.turn_start", rename_all = "camelCase")]
    TurnStart {
        ts: i64,
        turn_index: u64,
        transcript_length: usize,
    },

    #[serde(rename = "benchmark.llm_first_token", rename_all = "camelCase")]
    LlmFirstToken { ts: i64, turn_index: u64 },

    #[serde(rename = "benchmark.tts_first_chunk", rename_all = "camelCase")]
    TtsFirstChunk { ts: i64, turn_index: u64 },

    #[serde(rename = "benchmark.turn_end", rename_all = "camelCase")]
    TurnEnd { ts: i64, turn_index: u64 },

    #[serde(rename = "benchmark.turn_interrupted", rename_all = "camelCase")]
    TurnInterrupted { ts: i64, turn_index: u64 },
}

impl ServerMessage {
    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error {
            reason: reason.into(),
        }
    }

    /// Wire name of the message type, for logging and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::State { .. } => "state",
            Self::Status { .. } => "status",
            Self::LlmPartial { .. } => "llm_partial",
            Self::LlmComplete { .. } => "llm_complete",
            Self::LlmError { .. } => "llm_error",
            Self::Error { .. } => "error",
            Self::TurnStart { .. } => "benchmark.turn_start",
            Self::LlmFirstToken { .. } => "benchmark.llm_first_token",
            Self::TtsFirstChunk { .. } => "benchmark.tts_first_chunk",
            Self::TurnEnd { .. } => "benchmark.turn_end",
            Self::TurnInterrupted { .. } => "benchmark.turn_interrupted",
        }
    }
}

/// Parse a client text frame. Unknown types and ill-typed fields yield `None`;
/// the caller decides how to report it.
pub fn parse_client_json(text: &str) -> Option<ClientMessage> {
    serde_json::from_str(text).ok()
}

/// Serialize a server message to its JSON text form.
pub fn serialize_json(message: &ServerMessage) -> crate::error::Result<String> {
    Ok(serde_json::to_string(message)?)
}
