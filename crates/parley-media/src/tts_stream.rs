//! ElevenLabs streaming TTS: collects the chunked audio response per sentence.

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;

use parley_core::config::TtsConfig;

use crate::synth::SpeechSynthesizer;

const DEFAULT_VOICE: &str = "Rachel";
const DEFAULT_MODEL: &str = "eleven_turbo_v2";
const DEFAULT_OUTPUT_FORMAT: &str = "pcm_16000";

pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    api_key: String,
    voice: String,
    model: String,
    output_format: String,
    base_url: String,
}

impl ElevenLabsSynthesizer {
    pub fn from_config(config: &TtsConfig) -> Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No TTS API key configured"))?;

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            voice: config.voice.clone().unwrap_or_else(|| DEFAULT_VOICE.into()),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.into()),
            output_format: config
                .output_format
                .clone()
                .unwrap_or_else(|| DEFAULT_OUTPUT_FORMAT.into()),
            base_url: "https://api.elevenlabs.io".into(),
        })
    }

    /// Point the synthesizer at a different API host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    fn id(&self) -> &str {
        "elevenlabs"
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let url = build_tts_url(&self.base_url, &self.voice, &self.output_format);
        debug!(voice = %self.voice, model = %self.model, text_len = text.len(), "Starting TTS stream");

        let resp = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "text": text,
                "model_id": self.model,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("TTS API error {status}: {body}");
        }

        let mut audio = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => audio.extend_from_slice(&bytes),
                Err(e) => anyhow::bail!("TTS stream error: {e}"),
            }
        }

        if audio.is_empty() {
            anyhow::bail!("TTS returned no audio");
        }
        debug!(bytes = audio.len(), "TTS stream complete");
        Ok(audio)
    }
}

/// Build the streaming TTS request URL for a voice and output format.
pub fn build_tts_url(base_url: &str, voice: &str, output_format: &str) -> String {
    format!(
        "{}/v1/text-to-speech/{voice}/stream?output_format={output_format}",
        base_url.trim_end_matches('/')
    )
}
