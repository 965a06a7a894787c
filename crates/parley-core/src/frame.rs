//! Binary audio layouts.
//!
//! Frame mode: `u32 timestamp_ms | u16 length | u8 payload_type | payload`, all
//! big-endian. RTT mode: `u64 client_time_ms | payload`, big-endian.

use crate::error::{ParleyError, Result};

/// Size of the frame-mode header in bytes.
pub const FRAME_HEADER_LEN: usize = 7;

/// Size of the RTT-mode timestamp prefix in bytes.
pub const TIMESTAMP_PREFIX_LEN: usize = 8;

/// Largest payload a single frame can describe.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Payload type for raw inbound microphone audio.
pub const PAYLOAD_TYPE_AUDIO: u8 = 0x01;

/// Payload type for synthesized speech.
pub const PAYLOAD_TYPE_TTS: u8 = 0x02;

/// A decoded frame borrowing its payload from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub timestamp: u32,
    pub payload: &'a [u8],
    pub payload_type: u8,
}

/// Encode one frame. Payloads over [`MAX_FRAME_PAYLOAD`] bytes are rejected;
/// use [`split_into_frames`] for arbitrary-length audio.
pub fn encode_frame(timestamp_ms: u32, payload: &[u8], payload_type: u8) -> Result<Vec<u8>> {
    let len = u16::try_from(payload.len()).map_err(|_| {
        ParleyError::Protocol(format!(
            "frame payload of {} bytes exceeds {MAX_FRAME_PAYLOAD}",
            payload.len()
        ))
    })?;

    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&timestamp_ms.to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
    out.push(payload_type);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode one frame from the front of `bytes`. Returns `None` for a short
/// header or a declared length longer than the remaining bytes.
pub fn decode_frame(bytes: &[u8]) -> Option<Frame<'_>> {
    if bytes.len() < FRAME_HEADER_LEN {
        return None;
    }
    let timestamp = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let len = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
    let payload_type = bytes[6];
    let payload = bytes.get(FRAME_HEADER_LEN..FRAME_HEADER_LEN + len)?;

    Some(Frame {
        timestamp,
        payload,
        payload_type,
    })
}

/// Split a payload of any length into consecutive frames sharing one timestamp.
pub fn split_into_frames(timestamp_ms: u32, payload: &[u8], payload_type: u8) -> Vec<Vec<u8>> {
    if payload.is_empty() {
        return Vec::new();
    }
    payload
        .chunks(MAX_FRAME_PAYLOAD)
        .map(|chunk| {
            let mut out = Vec::with_capacity(FRAME_HEADER_LEN + chunk.len());
            out.extend_from_slice(&timestamp_ms.to_be_bytes());
            out.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
            out.push(payload_type);
            out.extend_from_slice(chunk);
            out
        })
        .collect()
}

/// Prefix a payload with an 8-byte client timestamp (RTT probes).
pub fn encode_timestamped(payload: &[u8], client_time_ms: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(TIMESTAMP_PREFIX_LEN + payload.len());
    out.extend_from_slice(&client_time_ms.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Read the timestamp prefix, or `None` if the buffer is too short.
pub fn decode_timestamp(bytes: &[u8]) -> Option<u64> {
    let prefix: [u8; TIMESTAMP_PREFIX_LEN] = bytes.get(..TIMESTAMP_PREFIX_LEN)?.try_into().ok()?;
    Some(u64::from_be_bytes(prefix))
}

/// Payload following the timestamp prefix; empty when the buffer is too short.
pub fn payload_after_timestamp(bytes: &[u8]) -> &[u8] {
    bytes.get(TIMESTAMP_PREFIX_LEN..).unwrap_or(&[])
}
