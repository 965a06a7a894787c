//! Speech synthesis seam and retry policy.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use tracing::warn;

use parley_core::config::RetryConfig;

/// Turns one sentence of text into audio bytes.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    fn id(&self) -> &str;

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

/// Backoff derived from the configured retry policy: min delay doubling up to
/// the max delay, at most `max_retries` retries after the first attempt.
pub fn synthesis_backoff(config: &RetryConfig) -> ExponentialBuilder {
    ExponentialBuilder::new()
        .with_min_delay(config.min_delay())
        .with_max_delay(config.max_delay())
        .with_factor(2.0)
        .with_max_times(config.max_retries)
}

/// Synthesize `text`, retrying failures with exponential backoff.
///
/// Returns the last error once the retries are exhausted.
pub async fn synthesize_with_retry(
    synth: &dyn SpeechSynthesizer,
    text: &str,
    config: &RetryConfig,
) -> Result<Vec<u8>> {
    (|| async { synth.synthesize(text).await })
        .retry(synthesis_backoff(config))
        .sleep(tokio::time::sleep)
        .notify(|err: &anyhow::Error, dur: Duration| {
            warn!(
                synth = synth.id(),
                error = %err,
                retry_in_ms = dur.as_millis() as u64,
                "Synthesis failed, retrying"
            );
        })
        .await
}
