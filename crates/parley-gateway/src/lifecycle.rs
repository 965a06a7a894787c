//! Session lifecycle: connected → streaming → closed for the binary path.
//!
//! Binary chunks never touch the turn queue. In echo mode they pass through the
//! ring buffer and straight into the echo engine.

use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info, trace, warn};

use parley_core::config::EchoConfig;
use parley_core::error::Result;
use parley_core::frame::{decode_timestamp, payload_after_timestamp};
use parley_core::protocol::{ServerMessage, SessionState};
use parley_media::{AudioRingBuffer, EchoEngine};

use crate::events::EventSink;

type Cleanup = Box<dyn FnOnce() + Send>;

struct EchoPath {
    buffer: AudioRingBuffer,
    engine: EchoEngine,
}

pub struct SessionLifecycle {
    conn_id: String,
    state: SessionState,
    sink: EventSink,
    muted: bool,
    timestamped: bool,
    echo: Option<EchoPath>,
    cleanup: Option<Cleanup>,
    received: u64,
    dropped_muted: u64,
}

impl SessionLifecycle {
    /// Start in `connected` and announce it. `cleanup` runs once, on close.
    pub fn new(
        conn_id: impl Into<String>,
        sink: EventSink,
        cleanup: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self::announce(conn_id.into(), sink, None, false, Box::new(cleanup))
    }

    /// Like [`new`](Self::new), but inbound audio is echoed back after the
    /// configured delay. Nothing is announced if the echo path can't be built.
    pub fn new_echo(
        conn_id: impl Into<String>,
        sink: EventSink,
        config: &EchoConfig,
        cleanup: impl FnOnce() + Send + 'static,
    ) -> Result<Self> {
        let buffer = AudioRingBuffer::new(config.buffer_capacity)?;
        let echo_sink = sink.clone();
        let engine = EchoEngine::new(Duration::from_millis(config.delay_ms), move |chunk| {
            echo_sink.send_raw(chunk);
        });
        let echo = EchoPath { buffer, engine };
        Ok(Self::announce(
            conn_id.into(),
            sink,
            Some(echo),
            config.timestamped,
            Box::new(cleanup),
        ))
    }

    fn announce(
        conn_id: String,
        sink: EventSink,
        echo: Option<EchoPath>,
        timestamped: bool,
        cleanup: Cleanup,
    ) -> Self {
        let lifecycle = Self {
            conn_id,
            state: SessionState::Connected,
            sink,
            muted: false,
            timestamped,
            echo,
            cleanup: Some(cleanup),
            received: 0,
            dropped_muted: 0,
        };
        lifecycle.sink.send(&ServerMessage::State {
            value: SessionState::Connected,
        });
        lifecycle
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        if self.muted != muted {
            debug!(conn_id = %self.conn_id, muted, "Mute toggled");
        }
        self.muted = muted;
    }

    pub fn on_binary(&mut self, chunk: Bytes) {
        if self.state == SessionState::Closed {
            return;
        }
        if self.muted {
            self.dropped_muted += 1;
            trace!(conn_id = %self.conn_id, len = chunk.len(), "Muted, dropping chunk");
            return;
        }
        if self.state == SessionState::Connected {
            self.transition(SessionState::Streaming);
        }
        self.received += 1;

        if self.timestamped {
            match decode_timestamp(&chunk) {
                Some(client_ts) => trace!(
                    conn_id = %self.conn_id,
                    client_ts,
                    skew_ms = Utc::now().timestamp_millis() - client_ts as i64,
                    payload_len = payload_after_timestamp(&chunk).len(),
                    "Timestamped chunk"
                ),
                None => debug!(conn_id = %self.conn_id, len = chunk.len(), "Chunk shorter than timestamp prefix"),
            }
        }

        if let Some(echo) = self.echo.as_mut() {
            echo.buffer.push(chunk);
            for chunk in echo.buffer.take_all() {
                echo.engine.push(chunk);
            }
        }
    }

    /// Enter `closed`. Later calls are no-ops.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(echo) = self.echo.as_ref() {
            echo.engine.flush();
        }
        self.transition(SessionState::Closed);
        info!(
            conn_id = %self.conn_id,
            received = self.received,
            dropped_muted = self.dropped_muted,
            "Session closed"
        );
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }

    pub fn on_error(&mut self, reason: &str) {
        warn!(conn_id = %self.conn_id, reason, "Session error");
        self.close();
    }

    fn transition(&mut self, next: SessionState) {
        debug!(conn_id = %self.conn_id, from = ?self.state, to = ?next, "Lifecycle transition");
        self.state = next;
        self.sink.send(&ServerMessage::State { value: next });
    }
}

impl Drop for SessionLifecycle {
    fn drop(&mut self) {
        self.close();
    }
}
