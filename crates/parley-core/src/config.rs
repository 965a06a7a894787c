//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Top-level Parley configuration, loaded from a JSON5 file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn: Option<TurnConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub echo: Option<EchoConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

fn default_port() -> u16 {
    18790
}

/// Language-model provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider: "openai", "openrouter", or "ollama" (default: "openai").
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// System prompt prepended to every request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_llm_provider() -> String {
    "openai".into()
}

impl LlmConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Text-to-speech (TTS) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// TTS provider (default: "elevenlabs").
    #[serde(default = "default_tts_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Voice ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Model ID (e.g. "eleven_turbo_v2").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Output format (default: "pcm_16000").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
}

fn default_tts_provider() -> String {
    "elevenlabs".into()
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Turn pipeline timing and queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Time allowed between opening the model stream and its first token.
    #[serde(default = "default_first_token_timeout_ms")]
    pub first_token_timeout_ms: u64,

    /// Time allowed for the first sentence of a turn to synthesize.
    #[serde(default = "default_first_audio_timeout_ms")]
    pub first_audio_timeout_ms: u64,

    /// Capacity of the per-session inbound event queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub tts_retry: RetryConfig,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            first_token_timeout_ms: default_first_token_timeout_ms(),
            first_audio_timeout_ms: default_first_audio_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            tts_retry: RetryConfig::default(),
        }
    }
}

fn default_first_token_timeout_ms() -> u64 {
    8_000
}

fn default_first_audio_timeout_ms() -> u64 {
    8_000
}

fn default_queue_capacity() -> usize {
    64
}

/// Exponential backoff for sentence synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> usize {
    3
}

fn default_min_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    2_000
}

impl RetryConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Diagnostic echo path configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoConfig {
    /// Delay before an inbound chunk is echoed back.
    #[serde(default)]
    pub delay_ms: u64,

    /// Ring buffer capacity in chunks.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Inbound chunks carry an 8-byte client timestamp prefix (RTT probes).
    #[serde(default)]
    pub timestamped: bool,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            delay_ms: 0,
            buffer_capacity: default_buffer_capacity(),
            timestamped: false,
        }
    }
}

fn default_buffer_capacity() -> usize {
    64
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Wrap outbound synthesized audio in 7-byte frame headers.
    #[serde(default)]
    pub framed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "parley_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &regex::Captures| match std::env::var(&caps[1]) {
        Ok(value) => value,
        Err(_) => {
            warn!(var = &caps[1], "Config references an unset environment variable");
            String::new()
        }
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        let config: Self = json5::from_str(&substituted).map_err(|e| {
            warn!(path = %path.display(), error = %e, "Failed to parse config");
            crate::error::ParleyError::Config(e.to_string())
        })?;
        debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    /// Default config file location.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or_else(default_port)
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    /// Model name, falling back to a provider-appropriate default.
    pub fn model(&self) -> String {
        let llm = self.llm.as_ref();
        if let Some(model) = llm.and_then(|l| l.model.clone()) {
            return model;
        }
        match llm.map(|l| l.provider.as_str()) {
            Some("ollama") => "llama3.2".to_string(),
            Some("openrouter") => "openai/gpt-4o-mini".to_string(),
            _ => "gpt-4o-mini".to_string(),
        }
    }

    pub fn max_tokens(&self) -> u32 {
        self.llm.as_ref().and_then(|l| l.max_tokens).unwrap_or(512)
    }

    pub fn temperature(&self) -> Option<f64> {
        self.llm.as_ref().and_then(|l| l.temperature)
    }

    pub fn system_prompt(&self) -> Option<String> {
        self.llm.as_ref().and_then(|l| l.system_prompt.clone())
    }

    pub fn turn(&self) -> TurnConfig {
        self.turn.clone().unwrap_or_default()
    }

    pub fn echo(&self) -> EchoConfig {
        self.echo.clone().unwrap_or_default()
    }

    pub fn audio_framed(&self) -> bool {
        self.audio.as_ref().is_some_and(|a| a.framed)
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        match &self.llm {
            Some(llm) if llm.provider != "ollama" && llm.resolve_api_key().is_none() => {
                warnings.push(format!("LLM provider '{}' has no API key configured", llm.provider));
            }
            None => warnings.push("No LLM provider configured".to_string()),
            _ => {}
        }

        match &self.tts {
            Some(tts) if tts.resolve_api_key().is_none() => {
                warnings.push(format!("TTS provider '{}' has no API key configured", tts.provider));
            }
            None => warnings.push("No TTS provider configured; turns will be text-only".to_string()),
            _ => {}
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        let turn = self.turn();
        if turn.queue_capacity == 0 {
            errors.push("turn.queue_capacity must be at least 1".to_string());
        }
        if turn.tts_retry.min_delay_ms > turn.tts_retry.max_delay_ms {
            errors.push(format!(
                "turn.tts_retry.min_delay_ms ({}) exceeds max_delay_ms ({})",
                turn.tts_retry.min_delay_ms, turn.tts_retry.max_delay_ms
            ));
        }

        if self.echo().buffer_capacity == 0 {
            errors.push("echo.buffer_capacity must be at least 1".to_string());
        }

        (warnings, errors)
    }
}

/// Base directory for Parley data: `~/.parley/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley")
}
