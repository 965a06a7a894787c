//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {e}"))
}

/// Record a new session on the given endpoint.
pub fn record_ws_connect(mode: &str) {
    let labels = [("mode", mode.to_string())];
    metrics::gauge!("sessions_active", &labels).increment(1.0);
    metrics::counter!("sessions_total", &labels).increment(1);
}

/// Record a session ending.
pub fn record_ws_disconnect(mode: &str) {
    let labels = [("mode", mode.to_string())];
    metrics::gauge!("sessions_active", &labels).decrement(1.0);
}

/// Record a finished turn with its wall-clock duration.
pub fn record_turn(outcome: &str, duration_secs: f64) {
    let labels = [("outcome", outcome.to_string())];
    metrics::counter!("turns_total", &labels).increment(1);
    metrics::histogram!("turn_duration_seconds", &labels).record(duration_secs);
}

/// Transcript to first model token.
pub fn record_first_token(latency_secs: f64) {
    metrics::histogram!("turn_first_token_seconds").record(latency_secs);
}

/// Transcript to first synthesized audio.
pub fn record_first_audio(latency_secs: f64) {
    metrics::histogram!("turn_first_audio_seconds").record(latency_secs);
}

/// A sentence whose synthesis failed after all retries.
pub fn record_synthesis_failure() {
    metrics::counter!("synthesis_failures_total").increment(1);
}

/// A client message that was rejected.
pub fn record_protocol_error(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("protocol_errors_total", &labels).increment(1);
}
