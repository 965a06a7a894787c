//! OpenAI Chat Completions API provider.
//!
//! Streams chat completions via `/v1/chat/completions`. Also serves
//! OpenRouter, Ollama, and other OpenAI-compatible endpoints.

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use parley_core::config::LlmConfig;

use crate::sse::{SseEvent, parse_sse_stream};
use crate::{ChunkStream, ChunkUsage, CompletionChunk, CompletionRequest, Credentials, LlmProvider};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// API style: determines minor behavior differences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    OpenAi,
    OpenRouter,
    Ollama,
}

impl ApiStyle {
    fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => OPENAI_BASE_URL,
            Self::OpenRouter => OPENROUTER_BASE_URL,
            Self::Ollama => OLLAMA_BASE_URL,
        }
    }

    fn id(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::OpenRouter => "openrouter",
            Self::Ollama => "ollama",
        }
    }
}

pub struct OpenAiProvider {
    pub base_url: String,
    pub api_style: ApiStyle,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(api_style: ApiStyle, base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(api_style.default_base_url())
                .trim_end_matches('/')
                .to_string(),
            api_style,
            client: reqwest::Client::new(),
        }
    }

    pub fn openai(base_url: Option<&str>) -> Self {
        Self::new(ApiStyle::OpenAi, base_url)
    }

    pub fn openrouter(base_url: Option<&str>) -> Self {
        Self::new(ApiStyle::OpenRouter, base_url)
    }

    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::new(ApiStyle::Ollama, base_url)
    }

    /// Build the provider named by the `llm` config section.
    pub fn from_config(config: &LlmConfig) -> anyhow::Result<Self> {
        let style = match config.provider.as_str() {
            "openai" => ApiStyle::OpenAi,
            "openrouter" => ApiStyle::OpenRouter,
            "ollama" => ApiStyle::Ollama,
            other => anyhow::bail!("Unknown LLM provider: {other}"),
        };
        Ok(Self::new(style, config.base_url.as_deref()))
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn build_messages(request: &CompletionRequest) -> Vec<serde_json::Value> {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(ref system) = request.system {
        messages.push(json!({ "role": "system", "content": system }));
    }
    messages.extend(
        request
            .messages
            .iter()
            .map(|m| json!({ "role": m.role, "content": m.content })),
    );
    messages
}

/// Map one SSE `data:` payload to a chunk. `None` means skip it.
fn parse_chunk(data: &str) -> Option<CompletionChunk> {
    let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(e) => {
            trace!(%e, data, "Failed to parse OpenAI chunk");
            return None;
        }
    };

    if let Some(usage) = chunk.usage {
        return Some(CompletionChunk {
            usage: Some(ChunkUsage {
                input_tokens: Some(usage.prompt_tokens),
                output_tokens: Some(usage.completion_tokens),
            }),
            ..Default::default()
        });
    }

    let choice = chunk.choices.into_iter().next()?;
    match (choice.delta.content, choice.finish_reason) {
        (Some(content), reason) if !content.is_empty() => Some(CompletionChunk {
            delta: Some(content),
            usage: None,
            stop_reason: reason,
        }),
        (_, Some(reason)) => Some(CompletionChunk {
            stop_reason: Some(reason),
            ..Default::default()
        }),
        _ => None,
    }
}

/// Turn an SSE event stream into completion chunks, ending at `[DONE]`.
pub fn chunk_stream<S>(sse: S) -> ChunkStream
where
    S: Stream<Item = anyhow::Result<SseEvent>> + Send + 'static,
{
    let stream = futures::stream::unfold(Box::pin(sse), |mut sse| async move {
        loop {
            match sse.next().await {
                Some(Ok(event)) => {
                    let data = event.data.trim();
                    // OpenAI terminates with "data: [DONE]"
                    if data == "[DONE]" {
                        return None;
                    }
                    if let Some(chunk) = parse_chunk(data) {
                        return Some((Ok(chunk), sse));
                    }
                }
                Some(Err(e)) => return Some((Err(e), sse)),
                None => return None,
            }
        }
    });
    Box::pin(stream)
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn id(&self) -> &str {
        self.api_style.id()
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> anyhow::Result<ChunkStream> {
        let api_key = match (credentials, self.api_style) {
            (Credentials::ApiKey { api_key }, _) => Some(api_key.as_str()),
            (Credentials::None, ApiStyle::Ollama) => None,
            (Credentials::None, _) => {
                anyhow::bail!("{} requires an API key", self.api_style.id())
            }
        };

        let body = OpenAiRequest {
            model: request.model.clone(),
            messages: build_messages(request),
            max_tokens: request.max_tokens,
            stream: true,
            temperature: request.temperature,
            stream_options: (self.api_style != ApiStyle::Ollama)
                .then_some(StreamOptions { include_usage: true }),
        };

        debug!(model = %body.model, base_url = %self.base_url, "Streaming OpenAI-compatible API");

        let mut req_builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");

        if let Some(key) = api_key {
            req_builder = req_builder.header("authorization", format!("Bearer {key}"));
        }
        if self.api_style == ApiStyle::OpenRouter {
            req_builder = req_builder.header("X-Title", "parley");
        }

        let response = req_builder.json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI API error {status}: {body}");
        }

        Ok(chunk_stream(parse_sse_stream(response)))
    }
}
