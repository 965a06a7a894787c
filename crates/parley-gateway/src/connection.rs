//! WebSocket connection lifecycle: read loop, writer task, turn processor.
//!
//! Text frames become [`ClientMessage`]s on the session's ordered queue.
//! Binary frames go straight to the lifecycle (and the echo path). One writer
//! task owns the socket's send half and drains the session's [`EventSink`].

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_core::protocol::{ClientMessage, ServerMessage, parse_client_json};

use crate::events::{EventSink, Outbound};
use crate::lifecycle::SessionLifecycle;
use crate::state::{GatewayState, SessionMode};
use crate::turn::{Session, TurnProcessor};

pub const INVALID_MESSAGE: &str = "invalid message";

/// How long an in-flight turn gets to wind down after the socket closes.
const PROCESSOR_GRACE: Duration = Duration::from_secs(2);

/// How long queued outbound events get to drain after the session ends.
const WRITER_GRACE: Duration = Duration::from_secs(2);

/// Handle a new WebSocket connection on the agent or echo endpoint.
pub async fn handle_ws_connection(state: Arc<GatewayState>, ws: WebSocket, mode: SessionMode) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, mode = mode.as_str(), "New WebSocket connection");

    let (mut ws_tx, ws_rx) = ws.split();
    let (sink, mut out_rx) = EventSink::channel(state.config.audio_framed());
    state.register(&conn_id, mode).await;
    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_connect(mode.as_str());

    // Cancelled when the session closes or the socket stops accepting writes
    let cancel = CancellationToken::new();

    let writer_cancel = cancel.clone();
    let writer_conn = conn_id.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            let msg = match out {
                Outbound::Text(text) => Message::Text(text.into()),
                Outbound::Binary(data) => Message::Binary(data),
            };
            if let Err(e) = ws_tx.send(msg).await {
                debug!(conn_id = %writer_conn, %e, "Socket write failed");
                writer_cancel.cancel();
                return;
            }
        }
        let _ = ws_tx.close().await;
    });

    let cleanup_cancel = cancel.clone();
    let cleanup = move || cleanup_cancel.cancel();
    let lifecycle = match mode {
        SessionMode::Agent => Ok(SessionLifecycle::new(conn_id.clone(), sink.clone(), cleanup)),
        SessionMode::Echo => {
            SessionLifecycle::new_echo(conn_id.clone(), sink.clone(), &state.config.echo(), cleanup)
        }
    };

    match lifecycle {
        Ok(lifecycle) => {
            run_session(&state, &conn_id, mode, lifecycle, &sink, ws_rx, &cancel).await;
        }
        Err(e) => {
            error!(conn_id = %conn_id, %e, "Echo path unavailable");
            sink.send(&ServerMessage::error(format!("echo unavailable: {e}")));
        }
    }

    // The writer finishes once every sink clone is gone
    drop(sink);
    if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        warn!(conn_id = %conn_id, "Writer did not drain in time");
        writer.abort();
    }

    if let Some(conn) = state.unregister(&conn_id).await {
        let duration_secs = (chrono::Utc::now() - conn.connected_at).num_milliseconds() as f64 / 1000.0;
        info!(conn_id = %conn_id, mode = mode.as_str(), duration_secs, "WebSocket connection closed");
    }
    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_disconnect(mode.as_str());
}

async fn run_session(
    state: &Arc<GatewayState>,
    conn_id: &str,
    mode: SessionMode,
    mut lifecycle: SessionLifecycle,
    sink: &EventSink,
    mut ws_rx: SplitStream<WebSocket>,
    cancel: &CancellationToken,
) {
    // Echo sessions never produce turns
    let (queue_tx, mut processor) = match mode {
        SessionMode::Agent => {
            let (tx, rx) = mpsc::channel(state.config.turn().queue_capacity.max(1));
            let processor = TurnProcessor::new(conn_id, state.pipeline.clone(), rx, sink.clone());
            (Some(tx), Some(tokio::spawn(processor.run())))
        }
        SessionMode::Echo => (None, None),
    };

    let mut failure: Option<String> = None;
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(conn_id = %conn_id, "Session cancelled");
                break;
            }
            frame = ws_rx.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                let Some(message) = parse_client_json(text.as_str()) else {
                    warn!(conn_id = %conn_id, len = text.as_str().len(), "Invalid message received");
                    #[cfg(feature = "metrics")]
                    crate::metrics::record_protocol_error("invalid_message");
                    sink.send(&ServerMessage::error(INVALID_MESSAGE));
                    continue;
                };
                if let ClientMessage::Mute { value } = message {
                    lifecycle.set_muted(value);
                }
                match &queue_tx {
                    Some(tx) => {
                        if tx.send(message).await.is_err() {
                            debug!(conn_id = %conn_id, "Turn processor gone");
                            break;
                        }
                    }
                    None => debug!(conn_id = %conn_id, kind = message.kind(), "Ignored on echo session"),
                }
            }
            Some(Ok(Message::Binary(data))) => lifecycle.on_binary(data),
            Some(Ok(Message::Close(_))) | None => {
                debug!(conn_id = %conn_id, "Client closed the socket");
                break;
            }
            Some(Ok(_)) => {
                // Axum answers pings itself
            }
            Some(Err(e)) => {
                failure = Some(e.to_string());
                break;
            }
        }
    }

    // Closing the queue aborts any in-flight turn
    drop(queue_tx);
    if let Some(processor) = processor.as_mut() {
        if let Some(session) = stop_processor(conn_id, processor).await {
            debug!(
                conn_id = %conn_id,
                turns = session.turn_index,
                history = session.history.len(),
                "Turn processor finished"
            );
        }
    }

    match failure {
        Some(reason) => lifecycle.on_error(&reason),
        None => lifecycle.close(),
    }
}

async fn stop_processor(conn_id: &str, processor: &mut JoinHandle<Session>) -> Option<Session> {
    match tokio::time::timeout(PROCESSOR_GRACE, &mut *processor).await {
        Ok(Ok(session)) => Some(session),
        Ok(Err(e)) => {
            error!(conn_id = %conn_id, %e, "Turn processor task failed");
            None
        }
        Err(_) => {
            warn!(conn_id = %conn_id, "Turn processor did not stop in time, aborting");
            processor.abort();
            None
        }
    }
}
