//! Turn processor: the per-session loop driving transcript → model → speech.
//!
//! All turn state lives in one task. Two sources feed it: the session's ordered
//! event queue and, while a turn runs, the model's token stream. Every wait
//! inside a turn also services the queue, so `control.interrupt` is observed
//! and a second `transcript_final` is rejected instead of queued.

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use parley_core::config::{Config, RetryConfig};
use parley_core::history::{ChatMessage, append_interrupted};
use parley_core::protocol::{ClientMessage, ServerMessage, TurnStatus};
use parley_media::{SentenceBuffer, SpeechSynthesizer, synthesize_with_retry};
use parley_providers::{ChunkStream, CompletionChunk, CompletionRequest, Credentials, LlmProvider};

use crate::events::EventSink;

pub const TURN_IN_PROGRESS: &str = "turn already in progress; send control.interrupt first";
pub const DUPLICATE_TURN_ID: &str = "duplicate turnId";
pub const EMPTY_TRANSCRIPT: &str = "empty transcript";

/// Per-turn model and timing settings.
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub system_prompt: Option<String>,
    pub first_token_timeout: Duration,
    pub first_audio_timeout: Duration,
    pub tts_retry: RetryConfig,
}

impl TurnSettings {
    pub fn from_config(config: &Config) -> Self {
        let turn = config.turn();
        Self {
            model: config.model(),
            max_tokens: config.max_tokens(),
            temperature: config.temperature(),
            system_prompt: config.system_prompt(),
            first_token_timeout: Duration::from_millis(turn.first_token_timeout_ms),
            first_audio_timeout: Duration::from_millis(turn.first_audio_timeout_ms),
            tts_retry: turn.tts_retry,
        }
    }
}

/// The external collaborators a turn runs against, shared by all sessions.
pub struct Pipeline {
    pub llm: Arc<dyn LlmProvider>,
    pub credentials: Credentials,
    /// `None` runs text-only turns.
    pub tts: Option<Arc<dyn SpeechSynthesizer>>,
    pub settings: TurnSettings,
}

/// Turn-affecting session state. Owned by the processor task.
#[derive(Debug, Default)]
pub struct Session {
    pub history: Vec<ChatMessage>,
    pub turn_index: u64,
    pub last_committed_turn_id: Option<String>,
    pub turn_in_progress: bool,
    pub abort_requested: bool,
    pub speculative_in_progress: bool,
}

/// How a turn ended.
#[derive(Debug)]
enum Outcome {
    Completed,
    Interrupted,
    Failed(String),
    /// The outbound transport is gone; nothing more can be sent.
    Disconnected,
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed(_) => "failed",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Per-turn response bookkeeping.
struct TurnRun {
    index: u64,
    turn_id: Option<String>,
    started: Instant,
    response: String,
    sentences: SentenceBuffer,
    first_token_at: Option<Duration>,
    first_audio_at: Option<Duration>,
    /// Only the turn's first sentence races the first-audio timeout.
    first_sentence_attempted: bool,
}

/// What a speculative run left behind once the final transcript (or session
/// end) arrived.
#[derive(Debug, Default)]
struct Speculation {
    tokens: Vec<String>,
    interrupted: bool,
    failed: bool,
    final_transcript: Option<(String, Option<String>)>,
}

/// Commit a speculative response only when the final transcript extends the
/// speculative one and the buffered reply is clean and non-empty.
fn should_commit(
    speculative: &str,
    final_text: &str,
    tokens: &[String],
    interrupted: bool,
    failed: bool,
) -> bool {
    let speculative = speculative.trim();
    !speculative.is_empty()
        && final_text.trim().starts_with(speculative)
        && tokens.iter().any(|t| !t.is_empty())
        && !interrupted
        && !failed
}

/// Next non-empty text delta, skipping usage and stop chunks.
async fn next_text(stream: &mut ChunkStream) -> Option<anyhow::Result<String>> {
    loop {
        match stream.next().await? {
            Ok(CompletionChunk {
                delta: Some(delta), ..
            }) if !delta.is_empty() => return Some(Ok(delta)),
            Ok(chunk) => {
                if let Some(usage) = chunk.usage {
                    trace!(
                        input_tokens = usage.input_tokens,
                        output_tokens = usage.output_tokens,
                        "Model usage"
                    );
                }
            }
            Err(e) => return Some(Err(e)),
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub struct TurnProcessor {
    conn_id: String,
    session: Session,
    pipeline: Arc<Pipeline>,
    queue: mpsc::Receiver<ClientMessage>,
    queue_closed: bool,
    sink: EventSink,
    /// `turnId` of the running turn, not yet committed.
    active_turn_id: Option<String>,
}

impl TurnProcessor {
    pub fn new(
        conn_id: impl Into<String>,
        pipeline: Arc<Pipeline>,
        queue: mpsc::Receiver<ClientMessage>,
        sink: EventSink,
    ) -> Self {
        Self {
            conn_id: conn_id.into(),
            session: Session::default(),
            pipeline,
            queue,
            queue_closed: false,
            sink,
            active_turn_id: None,
        }
    }

    /// Consume the queue until it closes or the transport goes away. Returns
    /// the final session state.
    pub async fn run(mut self) -> Session {
        debug!(conn_id = %self.conn_id, "Turn processor started");
        while let Some(message) = self.next_message().await {
            self.handle(message).await;
            if self.sink.is_closed() {
                debug!(conn_id = %self.conn_id, "Outbound transport closed");
                break;
            }
        }
        debug!(
            conn_id = %self.conn_id,
            turns = self.session.turn_index,
            "Turn processor stopped"
        );
        self.session
    }

    async fn next_message(&mut self) -> Option<ClientMessage> {
        if self.queue_closed {
            return None;
        }
        let message = self.queue.recv().await;
        if message.is_none() {
            self.queue_closed = true;
        }
        message
    }

    async fn handle(&mut self, message: ClientMessage) {
        trace!(conn_id = %self.conn_id, kind = message.kind(), "Dequeued message");
        match message {
            ClientMessage::Mute { .. } => {}
            ClientMessage::Interrupt {} => {
                debug!(conn_id = %self.conn_id, "Interrupt with no turn in progress");
            }
            ClientMessage::TranscriptSpeculative { text, .. } => self.speculate(text).await,
            ClientMessage::TranscriptFinal { text, turn_id } => {
                self.handle_final(text, turn_id, None).await;
            }
        }
    }

    fn is_duplicate(&self, turn_id: Option<&str>) -> bool {
        turn_id.is_some()
            && (turn_id == self.session.last_committed_turn_id.as_deref()
                || turn_id == self.active_turn_id.as_deref())
    }

    fn reject(&self, reason: &str) {
        debug!(conn_id = %self.conn_id, reason, "Rejected transcript");
        self.sink.send(&ServerMessage::error(reason));
    }

    /// Idempotency and emptiness checks, then a normal turn. `replay` carries
    /// committed speculative tokens in place of a fresh model call.
    async fn handle_final(&mut self, text: String, turn_id: Option<String>, replay: Option<Vec<String>>) {
        if self.is_duplicate(turn_id.as_deref()) {
            self.reject(DUPLICATE_TURN_ID);
            return;
        }
        if self.session.turn_in_progress {
            self.reject(TURN_IN_PROGRESS);
            return;
        }
        if text.trim().is_empty() {
            self.reject(EMPTY_TRANSCRIPT);
            return;
        }
        self.run_turn(text, turn_id, replay).await;
    }

    /// A message that arrived while a turn is running.
    fn on_message_during_turn(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Interrupt {} => {
                debug!(conn_id = %self.conn_id, turn_index = self.session.turn_index, "Interrupt requested");
                self.session.abort_requested = true;
            }
            ClientMessage::TranscriptFinal { turn_id, .. } => {
                if self.is_duplicate(turn_id.as_deref()) {
                    self.reject(DUPLICATE_TURN_ID);
                } else {
                    self.reject(TURN_IN_PROGRESS);
                }
            }
            other => trace!(conn_id = %self.conn_id, kind = other.kind(), "Ignored during turn"),
        }
    }

    /// Await `fut` while servicing the queue. With `abortable`, give up as
    /// soon as an abort is requested and return `None`.
    async fn race<F: Future>(&mut self, fut: F, abortable: bool) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            if abortable && self.session.abort_requested {
                return None;
            }
            if self.queue_closed {
                return Some(fut.await);
            }
            tokio::select! {
                message = self.queue.recv() => match message {
                    Some(message) => self.on_message_during_turn(message),
                    None => {
                        self.queue_closed = true;
                        self.session.abort_requested = true;
                    }
                },
                out = &mut fut => return Some(out),
            }
        }
    }

    fn request(&self, messages: Vec<ChatMessage>) -> CompletionRequest {
        let settings = &self.pipeline.settings;
        CompletionRequest {
            model: settings.model.clone(),
            messages,
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            system: settings.system_prompt.clone(),
        }
    }

    // --- Speculative path ---

    async fn speculate(&mut self, text: String) {
        if self.session.turn_in_progress || self.session.speculative_in_progress {
            return;
        }
        if text.trim().is_empty() {
            trace!(conn_id = %self.conn_id, "Blank speculative transcript ignored");
            return;
        }

        self.session.speculative_in_progress = true;
        let speculation = self.collect_speculation(&text).await;
        self.session.speculative_in_progress = false;

        let Some((final_text, turn_id)) = speculation.final_transcript else {
            debug!(conn_id = %self.conn_id, "Session ended during speculation");
            return;
        };

        if should_commit(&text, &final_text, &speculation.tokens, speculation.interrupted, speculation.failed) {
            info!(
                conn_id = %self.conn_id,
                tokens = speculation.tokens.len(),
                "Committing speculative response"
            );
            self.handle_final(final_text, turn_id, Some(speculation.tokens)).await;
        } else {
            debug!(
                conn_id = %self.conn_id,
                tokens = speculation.tokens.len(),
                interrupted = speculation.interrupted,
                failed = speculation.failed,
                "Discarding speculative response"
            );
            self.handle_final(final_text, turn_id, None).await;
        }
    }

    /// Returns `true` once the speculative stream should stop being consumed.
    fn on_speculative_message(&mut self, speculation: &mut Speculation, message: Option<ClientMessage>) -> bool {
        match message {
            None => {
                self.queue_closed = true;
                true
            }
            Some(ClientMessage::Interrupt {}) => {
                speculation.interrupted = true;
                true
            }
            Some(ClientMessage::TranscriptFinal { text, turn_id }) => {
                speculation.final_transcript = Some((text, turn_id));
                true
            }
            Some(other) => {
                trace!(conn_id = %self.conn_id, kind = other.kind(), "Ignored during speculation");
                false
            }
        }
    }

    async fn collect_speculation(&mut self, text: &str) -> Speculation {
        let mut speculation = Speculation::default();

        let mut messages = self.session.history.clone();
        messages.push(ChatMessage::user(text));
        let request = self.request(messages);
        let pipeline = self.pipeline.clone();
        let open = async move { pipeline.llm.stream(&request, &pipeline.credentials).await };
        tokio::pin!(open);

        let opened = loop {
            tokio::select! {
                message = self.queue.recv() => {
                    if self.on_speculative_message(&mut speculation, message) {
                        break None;
                    }
                }
                result = &mut open => break Some(result),
            }
        };

        match opened {
            Some(Ok(mut stream)) => loop {
                tokio::select! {
                    message = self.queue.recv() => {
                        if self.on_speculative_message(&mut speculation, message) {
                            break;
                        }
                    }
                    next = next_text(&mut stream) => match next {
                        Some(Ok(token)) => speculation.tokens.push(token),
                        Some(Err(e)) => {
                            warn!(conn_id = %self.conn_id, error = %e, "Speculative stream failed");
                            speculation.failed = true;
                            break;
                        }
                        None => break,
                    },
                }
            },
            Some(Err(e)) => {
                warn!(conn_id = %self.conn_id, error = %e, "Speculative stream failed to open");
                speculation.failed = true;
            }
            None => {}
        }

        while speculation.final_transcript.is_none() && !self.queue_closed {
            let message = self.queue.recv().await;
            self.on_speculative_message(&mut speculation, message);
        }
        speculation
    }

    // --- Normal path ---

    async fn run_turn(&mut self, text: String, turn_id: Option<String>, replay: Option<Vec<String>>) {
        self.session.turn_in_progress = true;
        self.session.abort_requested = false;
        self.session.turn_index += 1;
        self.session.history.push(ChatMessage::user(text.as_str()));
        self.active_turn_id = turn_id.clone();

        let mut run = TurnRun {
            index: self.session.turn_index,
            turn_id,
            started: Instant::now(),
            response: String::new(),
            sentences: SentenceBuffer::new(),
            first_token_at: None,
            first_audio_at: None,
            first_sentence_attempted: false,
        };
        info!(
            conn_id = %self.conn_id,
            turn_index = run.index,
            speculative = replay.is_some(),
            "Turn started"
        );
        self.sink.send(&ServerMessage::TurnStart {
            ts: now_ms(),
            turn_index: run.index,
            transcript_length: text.chars().count(),
        });
        self.sink.send(&ServerMessage::Status {
            value: TurnStatus::Thinking,
        });

        let outcome = self.stream_response(&mut run, replay).await;
        self.finish_turn(&run, outcome);

        self.active_turn_id = None;
        self.session.turn_in_progress = false;
        self.session.abort_requested = false;
    }

    /// Stop reason if the turn must end now.
    fn stop_check(&self) -> Option<Outcome> {
        if self.sink.is_closed() {
            Some(Outcome::Disconnected)
        } else if self.session.abort_requested {
            Some(Outcome::Interrupted)
        } else {
            None
        }
    }

    async fn open_stream(&mut self) -> Result<(ChunkStream, Option<anyhow::Result<String>>), Outcome> {
        let request = self.request(self.session.history.clone());
        let pipeline = self.pipeline.clone();
        let timeout = pipeline.settings.first_token_timeout;
        let first = async move {
            let mut stream = pipeline.llm.stream(&request, &pipeline.credentials).await?;
            let first = next_text(&mut stream).await;
            anyhow::Ok((stream, first))
        };

        match self.race(tokio::time::timeout(timeout, first), true).await {
            None => Err(self.stop_check().unwrap_or(Outcome::Interrupted)),
            Some(Err(_)) => Err(Outcome::Failed(format!(
                "first token timeout after {}ms",
                timeout.as_millis()
            ))),
            Some(Ok(Err(e))) => Err(Outcome::Failed(e.to_string())),
            Some(Ok(Ok(opened))) => Ok(opened),
        }
    }

    async fn stream_response(&mut self, run: &mut TurnRun, replay: Option<Vec<String>>) -> Outcome {
        let (mut stream, mut next): (ChunkStream, _) = match replay {
            Some(tokens) => {
                let mut stream: ChunkStream = Box::pin(futures::stream::iter(
                    tokens
                        .into_iter()
                        .map(|t| Ok::<_, anyhow::Error>(CompletionChunk::text(t))),
                ));
                let first = next_text(&mut stream).await;
                (stream, first)
            }
            None => match self.open_stream().await {
                Ok(opened) => opened,
                Err(outcome) => return outcome,
            },
        };

        loop {
            let token = match next {
                None => break,
                Some(Err(e)) => return Outcome::Failed(e.to_string()),
                Some(Ok(token)) => token,
            };
            if let Some(outcome) = self.stop_check() {
                return outcome;
            }

            if run.first_token_at.is_none() {
                let elapsed = run.started.elapsed();
                run.first_token_at = Some(elapsed);
                debug!(
                    conn_id = %self.conn_id,
                    turn_index = run.index,
                    latency_ms = elapsed.as_millis() as u64,
                    "First token"
                );
                #[cfg(feature = "metrics")]
                crate::metrics::record_first_token(elapsed.as_secs_f64());
                self.sink.send(&ServerMessage::LlmFirstToken {
                    ts: now_ms(),
                    turn_index: run.index,
                });
            }

            run.response.push_str(&token);
            self.sink.send(&ServerMessage::LlmPartial {
                text: token.clone(),
                turn_id: run.turn_id.clone(),
            });

            for sentence in run.sentences.push(&token) {
                if let Some(outcome) = self.speak(run, sentence).await {
                    return outcome;
                }
            }

            next = match self.race(next_text(&mut stream), true).await {
                Some(next) => next,
                None => return self.stop_check().unwrap_or(Outcome::Interrupted),
            };
        }

        if run.first_token_at.is_none() {
            return Outcome::Failed("model returned no tokens".into());
        }
        if let Some(rest) = run.sentences.finish() {
            if let Some(outcome) = self.speak(run, rest).await {
                return outcome;
            }
        }
        Outcome::Completed
    }

    /// Synthesize one sentence and send its audio. Returns an outcome when the
    /// turn must stop.
    async fn speak(&mut self, run: &mut TurnRun, sentence: String) -> Option<Outcome> {
        let tts = self.pipeline.tts.clone()?;
        let retry = self.pipeline.settings.tts_retry.clone();
        let first_audio_timeout = self.pipeline.settings.first_audio_timeout;
        let len = sentence.len();
        let synth = async move { synthesize_with_retry(tts.as_ref(), &sentence, &retry).await };

        let result = if !run.first_sentence_attempted {
            run.first_sentence_attempted = true;
            match self.race(tokio::time::timeout(first_audio_timeout, synth), false).await {
                Some(Ok(result)) => result,
                _ => Err(anyhow::anyhow!(
                    "first audio timeout after {}ms",
                    first_audio_timeout.as_millis()
                )),
            }
        } else {
            match self.race(synth, false).await {
                Some(result) => result,
                None => return self.stop_check(),
            }
        };

        // A synthesis that finished after an abort is dropped
        if let Some(outcome) = self.stop_check() {
            return Some(outcome);
        }

        let audio = match result {
            Ok(audio) => audio,
            Err(e) => {
                warn!(
                    conn_id = %self.conn_id,
                    turn_index = run.index,
                    sentence_len = len,
                    error = %e,
                    "Synthesis failed, skipping sentence audio"
                );
                #[cfg(feature = "metrics")]
                crate::metrics::record_synthesis_failure();
                return None;
            }
        };

        if run.first_audio_at.is_none() {
            let elapsed = run.started.elapsed();
            run.first_audio_at = Some(elapsed);
            debug!(
                conn_id = %self.conn_id,
                turn_index = run.index,
                latency_ms = elapsed.as_millis() as u64,
                "First audio"
            );
            #[cfg(feature = "metrics")]
            crate::metrics::record_first_audio(elapsed.as_secs_f64());
            self.sink.send(&ServerMessage::Status {
                value: TurnStatus::Synthesizing,
            });
            self.sink.send(&ServerMessage::TtsFirstChunk {
                ts: now_ms(),
                turn_index: run.index,
            });
        }

        if !self.sink.send_audio(&audio) {
            return Some(Outcome::Disconnected);
        }
        None
    }

    fn finish_turn(&mut self, run: &TurnRun, outcome: Outcome) {
        let elapsed_ms = run.started.elapsed().as_millis() as u64;
        #[cfg(feature = "metrics")]
        crate::metrics::record_turn(outcome.label(), run.started.elapsed().as_secs_f64());

        // A failed turn stays retryable under the same turnId
        if run.turn_id.is_some() && !matches!(outcome, Outcome::Failed(_)) {
            self.session.last_committed_turn_id = run.turn_id.clone();
        }

        match &outcome {
            Outcome::Completed => {
                self.session
                    .history
                    .push(ChatMessage::assistant(run.response.as_str()));
                self.sink.send(&ServerMessage::TurnEnd {
                    ts: now_ms(),
                    turn_index: run.index,
                });
                self.sink.send(&ServerMessage::LlmComplete {
                    text: run.response.clone(),
                    turn_id: run.turn_id.clone(),
                });
            }
            Outcome::Interrupted | Outcome::Disconnected => {
                if let Cow::Owned(history) = append_interrupted(&self.session.history, &run.response) {
                    self.session.history = history;
                }
                self.sink.send(&ServerMessage::TurnInterrupted {
                    ts: now_ms(),
                    turn_index: run.index,
                });
            }
            Outcome::Failed(reason) => {
                if !run.response.trim().is_empty() {
                    self.session
                        .history
                        .push(ChatMessage::assistant(run.response.as_str()));
                }
                self.sink.send(&ServerMessage::LlmError {
                    reason: reason.clone(),
                    turn_id: run.turn_id.clone(),
                });
            }
        }

        info!(
            conn_id = %self.conn_id,
            turn_index = run.index,
            outcome = outcome.label(),
            elapsed_ms,
            first_token_ms = run.first_token_at.map(|d| d.as_millis() as u64),
            first_audio_ms = run.first_audio_at.map(|d| d.as_millis() as u64),
            response_len = run.response.len(),
            "Turn finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parley_core::history::{INTERRUPTED_MARKER, Role};
    use serde_json::{Value, json};
    use tokio::task::JoinHandle;

    use crate::events::Outbound;

    #[derive(Clone)]
    enum Step {
        Token(&'static str),
        Delay(Duration),
        Fail(&'static str),
        Hang,
    }

    /// Replays one script per `stream` call.
    struct ScriptedProvider {
        scripts: Mutex<VecDeque<Vec<Step>>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn stream(
            &self,
            _request: &CompletionRequest,
            _credentials: &Credentials,
        ) -> anyhow::Result<ChunkStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let steps = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
            let stream = futures::stream::unfold(steps.into_iter(), |mut steps| async move {
                loop {
                    match steps.next()? {
                        Step::Token(t) => return Some((Ok(CompletionChunk::text(t)), steps)),
                        Step::Delay(d) => tokio::time::sleep(d).await,
                        Step::Fail(reason) => return Some((Err(anyhow::anyhow!(reason)), steps)),
                        Step::Hang => futures::future::pending::<()>().await,
                    }
                }
            });
            Ok(Box::pin(stream))
        }
    }

    /// Fails the first `failures` calls, then returns `audio:<text>`. Every
    /// call takes `delay`.
    struct FakeSynth {
        failures: usize,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl FakeSynth {
        fn new(failures: usize, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                failures,
                delay,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for FakeSynth {
        fn id(&self) -> &str {
            "fake"
        }

        async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if n < self.failures {
                anyhow::bail!("synthesis attempt {n} failed");
            }
            Ok(format!("audio:{text}").into_bytes())
        }
    }

    fn settings() -> TurnSettings {
        TurnSettings {
            model: "test-model".into(),
            max_tokens: 64,
            temperature: None,
            system_prompt: None,
            first_token_timeout: Duration::from_secs(2),
            first_audio_timeout: Duration::from_secs(2),
            tts_retry: RetryConfig {
                max_retries: 3,
                min_delay_ms: 1,
                max_delay_ms: 5,
            },
        }
    }

    struct Harness {
        queue: mpsc::Sender<ClientMessage>,
        events: mpsc::UnboundedReceiver<Outbound>,
        processor: JoinHandle<Session>,
        provider: Arc<ScriptedProvider>,
    }

    impl Harness {
        fn start(scripts: Vec<Vec<Step>>, synth: Option<Arc<FakeSynth>>) -> Self {
            Self::with_settings(scripts, synth, settings())
        }

        fn with_settings(scripts: Vec<Vec<Step>>, synth: Option<Arc<FakeSynth>>, settings: TurnSettings) -> Self {
            let provider = Arc::new(ScriptedProvider {
                scripts: Mutex::new(scripts.into()),
                calls: AtomicUsize::new(0),
            });
            let pipeline = Arc::new(Pipeline {
                llm: provider.clone(),
                credentials: Credentials::None,
                tts: synth.map(|s| s as Arc<dyn SpeechSynthesizer>),
                settings,
            });
            let (queue, rx) = mpsc::channel(16);
            let (sink, events) = EventSink::channel(false);
            let processor = tokio::spawn(TurnProcessor::new("test", pipeline, rx, sink).run());
            Self {
                queue,
                events,
                processor,
                provider,
            }
        }

        async fn send(&self, message: Value) {
            let message: ClientMessage = serde_json::from_value(message).unwrap();
            self.queue.send(message).await.unwrap();
        }

        /// Next outbound event; audio shows up as `{"type": "<audio>", "text": ...}`.
        async fn next(&mut self) -> Value {
            let out = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("timed out waiting for an event")
                .expect("event channel closed");
            match out {
                Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
                Outbound::Binary(audio) => {
                    json!({"type": "<audio>", "text": String::from_utf8_lossy(&audio)})
                }
            }
        }

        /// Collect events up to and including the first of type `kind`.
        async fn until(&mut self, kind: &str) -> Vec<Value> {
            let mut seen = Vec::new();
            loop {
                let event = self.next().await;
                let done = event["type"] == kind;
                seen.push(event);
                if done {
                    return seen;
                }
            }
        }

        async fn finish(self) -> Session {
            drop(self.queue);
            tokio::time::timeout(Duration::from_secs(5), self.processor)
                .await
                .expect("processor did not stop")
                .unwrap()
        }
    }

    fn kinds(events: &[Value]) -> Vec<&str> {
        events.iter().map(|e| e["type"].as_str().unwrap()).collect()
    }

    fn final_msg(text: &str, turn_id: Option<&str>) -> Value {
        match turn_id {
            Some(id) => json!({"type": "transcript_final", "text": text, "turnId": id}),
            None => json!({"type": "transcript_final", "text": text}),
        }
    }

    #[test]
    fn test_should_commit_rules() {
        let tokens = vec!["It's".to_string(), " nice".to_string()];
        assert!(should_commit("The weather", "The weather today is sunny", &tokens, false, false));
        assert!(should_commit(" The weather ", "The weather", &tokens, false, false));
        assert!(!should_commit("The weather", "What time is it", &tokens, false, false));
        assert!(!should_commit("", "anything", &tokens, false, false));
        assert!(!should_commit("The weather", "The weather today", &[], false, false));
        assert!(!should_commit("The weather", "The weather today", &tokens, true, false));
        assert!(!should_commit("The weather", "The weather today", &tokens, false, true));
    }

    #[tokio::test]
    async fn test_normal_turn_streams_text_and_audio() {
        let synth = FakeSynth::new(0, Duration::ZERO);
        let mut h = Harness::start(
            vec![vec![
                Step::Token("Hi there."),
                Step::Token(" How are"),
                Step::Token(" you?"),
            ]],
            Some(synth),
        );

        h.send(final_msg("hello", Some("t1"))).await;
        let events = h.until("llm_complete").await;
        assert_eq!(
            kinds(&events),
            vec![
                "benchmark.turn_start",
                "status",
                "benchmark.llm_first_token",
                "llm_partial",
                "llm_partial",
                "status",
                "benchmark.tts_first_chunk",
                "<audio>",
                "llm_partial",
                "<audio>",
                "benchmark.turn_end",
                "llm_complete",
            ]
        );
        assert_eq!(events[0]["turnIndex"], 1);
        assert_eq!(events[0]["transcriptLength"], 5);
        assert_eq!(events[1]["value"], "thinking");
        assert_eq!(events[3]["text"], "Hi there.");
        assert_eq!(events[3]["turnId"], "t1");
        assert_eq!(events[5]["value"], "synthesizing");
        assert_eq!(events[7]["text"], "audio:Hi there.");
        assert_eq!(events[9]["text"], "audio:How are you?");
        assert_eq!(events[11]["text"], "Hi there. How are you?");
        assert_eq!(events[11]["turnId"], "t1");

        let session = h.finish().await;
        assert_eq!(session.turn_index, 1);
        assert!(!session.turn_in_progress);
        assert!(!session.abort_requested);
        assert_eq!(session.last_committed_turn_id.as_deref(), Some("t1"));
        assert_eq!(
            session.history,
            vec![
                ChatMessage::user("hello"),
                ChatMessage::assistant("Hi there. How are you?"),
            ]
        );
    }

    #[tokio::test]
    async fn test_speculative_commit_reuses_buffered_tokens() {
        let mut h = Harness::start(
            vec![vec![Step::Token("It's"), Step::Token(" nice"), Step::Token(" out")]],
            None,
        );

        h.send(json!({"type": "transcript_speculative", "text": "The weather"}))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.send(final_msg("The weather today is sunny", None)).await;

        let events = h.until("llm_complete").await;
        let partials: Vec<&str> = events
            .iter()
            .filter(|e| e["type"] == "llm_partial")
            .map(|e| e["text"].as_str().unwrap())
            .collect();
        assert_eq!(partials, vec!["It's", " nice", " out"]);
        assert_eq!(events.last().unwrap()["text"], "It's nice out");
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 1);

        let session = h.finish().await;
        assert_eq!(
            session.history,
            vec![
                ChatMessage::user("The weather today is sunny"),
                ChatMessage::assistant("It's nice out"),
            ]
        );
        assert!(!session.speculative_in_progress);
    }

    #[tokio::test]
    async fn test_speculative_mismatch_runs_fresh_turn() {
        let mut h = Harness::start(
            vec![
                vec![Step::Token("It's"), Step::Token(" nice"), Step::Token(" out")],
                vec![Step::Token("It's"), Step::Token(" three.")],
            ],
            None,
        );

        h.send(json!({"type": "transcript_speculative", "text": "The weather"}))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.send(final_msg("What time is it", None)).await;

        let events = h.until("llm_complete").await;
        assert!(events.iter().all(|e| e["text"] != " nice"));
        assert_eq!(events.last().unwrap()["text"], "It's three.");
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 2);

        let session = h.finish().await;
        assert_eq!(session.turn_index, 1);
        assert_eq!(session.history[0], ChatMessage::user("What time is it"));
        assert_eq!(session.history[1], ChatMessage::assistant("It's three."));
    }

    #[tokio::test]
    async fn test_interrupt_during_speculation_discards() {
        let mut h = Harness::start(
            vec![
                vec![Step::Token("Stale"), Step::Delay(Duration::from_secs(30))],
                vec![Step::Token("Fresh.")],
            ],
            None,
        );

        h.send(json!({"type": "transcript_speculative", "text": "Tell me"}))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.send(json!({"type": "control.interrupt"})).await;
        h.send(final_msg("Tell me a joke", None)).await;

        let events = h.until("llm_complete").await;
        assert_eq!(events.last().unwrap()["text"], "Fresh.");
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 2);
        h.finish().await;
    }

    #[tokio::test]
    async fn test_interrupt_keeps_partial_reply_in_history() {
        let mut h = Harness::start(
            vec![vec![
                Step::Token("Hello"),
                Step::Token(" the"),
                Step::Delay(Duration::from_secs(30)),
                Step::Token(" world"),
            ]],
            None,
        );

        h.send(final_msg("Say hi", None)).await;
        h.until("llm_partial").await;
        h.until("llm_partial").await;
        h.send(json!({"type": "control.interrupt"})).await;

        let events = h.until("benchmark.turn_interrupted").await;
        assert!(events.iter().all(|e| e["type"] != "llm_complete"));
        assert_eq!(events.last().unwrap()["turnIndex"], 1);

        let session = h.finish().await;
        assert!(!session.turn_in_progress);
        assert!(!session.abort_requested);
        assert_eq!(session.history.len(), 2);
        let last = &session.history[1];
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, format!("Hello the{INTERRUPTED_MARKER}"));
    }

    #[tokio::test]
    async fn test_final_during_turn_is_rejected() {
        let mut h = Harness::start(
            vec![vec![Step::Token("Hel"), Step::Delay(Duration::from_secs(30))]],
            None,
        );

        h.send(final_msg("one", Some("t1"))).await;
        h.until("llm_partial").await;

        h.send(final_msg("two", Some("t2"))).await;
        let rejection = h.next().await;
        assert_eq!(rejection["type"], "error");
        assert_eq!(rejection["reason"], TURN_IN_PROGRESS);

        h.send(final_msg("one again", Some("t1"))).await;
        let rejection = h.next().await;
        assert_eq!(rejection["reason"], DUPLICATE_TURN_ID);

        h.send(json!({"type": "control.interrupt"})).await;
        h.until("benchmark.turn_interrupted").await;

        let provider = h.provider.clone();
        let session = h.finish().await;
        assert_eq!(session.turn_index, 1);
        assert_eq!(session.last_committed_turn_id.as_deref(), Some("t1"));
        // "Hel" is too short to keep
        assert_eq!(session.history, vec![ChatMessage::user("one")]);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_turn_id_rejected_after_completion() {
        let mut h = Harness::start(vec![vec![Step::Token("Hello.")], vec![Step::Token("unused")]], None);

        h.send(final_msg("hi", Some("t1"))).await;
        h.until("llm_complete").await;

        h.send(final_msg("hi", Some("t1"))).await;
        let rejection = h.next().await;
        assert_eq!(rejection["type"], "error");
        assert_eq!(rejection["reason"], DUPLICATE_TURN_ID);
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 1);

        let session = h.finish().await;
        assert_eq!(session.turn_index, 1);
        assert_eq!(session.history.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_transcript_rejected() {
        let mut h = Harness::start(vec![], None);
        h.send(final_msg("   ", Some("t9"))).await;
        let rejection = h.next().await;
        assert_eq!(rejection["reason"], EMPTY_TRANSCRIPT);
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 0);

        let session = h.finish().await;
        assert_eq!(session.turn_index, 0);
        assert!(session.history.is_empty());
        assert!(session.last_committed_turn_id.is_none());
    }

    #[tokio::test]
    async fn test_first_token_timeout_then_recovery() {
        let settings = TurnSettings {
            first_token_timeout: Duration::from_millis(100),
            ..settings()
        };
        let mut h = Harness::with_settings(
            vec![vec![Step::Hang], vec![Step::Token("Back.")]],
            None,
            settings,
        );

        h.send(final_msg("one", Some("t1"))).await;
        let events = h.until("llm_error").await;
        assert!(events.last().unwrap()["reason"]
            .as_str()
            .unwrap()
            .contains("timeout"));
        assert!(events.iter().all(|e| e["type"] != "benchmark.turn_interrupted"));

        // The failed turn never committed, so the client may retry the same id
        h.send(final_msg("one", Some("t1"))).await;
        let events = h.until("llm_complete").await;
        assert_eq!(events[0]["type"], "benchmark.turn_start");
        assert_eq!(events.last().unwrap()["text"], "Back.");
        assert_eq!(events.last().unwrap()["turnId"], "t1");
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 2);

        let session = h.finish().await;
        assert_eq!(session.turn_index, 2);
        assert!(!session.turn_in_progress);
        assert_eq!(session.last_committed_turn_id.as_deref(), Some("t1"));
        assert_eq!(session.history.last(), Some(&ChatMessage::assistant("Back.")));
    }

    #[tokio::test]
    async fn test_model_failure_keeps_produced_text() {
        let mut h = Harness::start(
            vec![vec![Step::Token("Partial answer"), Step::Fail("upstream reset")]],
            None,
        );

        h.send(final_msg("question", Some("q1"))).await;
        let events = h.until("llm_error").await;
        let error = events.last().unwrap();
        assert!(error["reason"].as_str().unwrap().contains("upstream reset"));
        assert_eq!(error["turnId"], "q1");

        let session = h.finish().await;
        assert!(!session.turn_in_progress);
        assert!(session.last_committed_turn_id.is_none());
        assert_eq!(session.history.last(), Some(&ChatMessage::assistant("Partial answer")));
    }

    #[tokio::test]
    async fn test_synthesis_retried_then_emitted() {
        let synth = FakeSynth::new(2, Duration::ZERO);
        let mut h = Harness::start(vec![vec![Step::Token("Hi.")]], Some(synth.clone()));

        h.send(final_msg("hello", None)).await;
        let events = h.until("llm_complete").await;
        assert!(events.iter().any(|e| e["type"] == "<audio>" && e["text"] == "audio:Hi."));
        assert!(events.iter().any(|e| e["type"] == "benchmark.tts_first_chunk"));
        assert_eq!(synth.calls.load(Ordering::SeqCst), 3);
        h.finish().await;
    }

    #[tokio::test]
    async fn test_synthesis_exhausted_skips_audio_only() {
        let synth = FakeSynth::new(usize::MAX, Duration::ZERO);
        let mut h = Harness::start(vec![vec![Step::Token("Hi.")]], Some(synth.clone()));

        h.send(final_msg("hello", None)).await;
        let events = h.until("llm_complete").await;
        assert!(events.iter().all(|e| e["type"] != "<audio>"));
        assert!(events.iter().all(|e| e["value"] != "synthesizing"));
        assert_eq!(events.last().unwrap()["text"], "Hi.");
        // One attempt plus three retries
        assert_eq!(synth.calls.load(Ordering::SeqCst), 4);
        h.finish().await;
    }

    #[tokio::test]
    async fn test_only_first_sentence_races_first_audio_timeout() {
        let settings = TurnSettings {
            first_audio_timeout: Duration::from_millis(100),
            ..settings()
        };
        let synth = FakeSynth::new(0, Duration::from_millis(300));
        let mut h = Harness::with_settings(
            vec![vec![Step::Token("One. "), Step::Token("Two. "), Step::Token("Three")]],
            Some(synth.clone()),
            settings,
        );

        h.send(final_msg("count", None)).await;
        let events = h.until("llm_complete").await;
        let audio: Vec<&str> = events
            .iter()
            .filter(|e| e["type"] == "<audio>")
            .map(|e| e["text"].as_str().unwrap())
            .collect();
        assert_eq!(audio, vec!["audio:Two.", "audio:Three"]);
        assert_eq!(
            events
                .iter()
                .filter(|e| e["type"] == "benchmark.tts_first_chunk")
                .count(),
            1
        );
        assert_eq!(events.last().unwrap()["text"], "One. Two. Three");
        assert_eq!(synth.calls.load(Ordering::SeqCst), 3);
        h.finish().await;
    }

    #[tokio::test]
    async fn test_synthesis_finished_after_interrupt_is_dropped() {
        let synth = FakeSynth::new(0, Duration::from_millis(300));
        let mut h = Harness::start(
            vec![vec![
                Step::Token("Hello there. "),
                Step::Delay(Duration::from_secs(30)),
            ]],
            Some(synth.clone()),
        );

        h.send(final_msg("greet me", None)).await;
        h.until("llm_partial").await;
        h.send(json!({"type": "control.interrupt"})).await;

        let events = h.until("benchmark.turn_interrupted").await;
        assert!(events.iter().all(|e| e["type"] != "<audio>"));
        assert!(events.iter().all(|e| e["type"] != "benchmark.tts_first_chunk"));
        assert!(events.iter().all(|e| e["value"] != "synthesizing"));
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);

        let session = h.finish().await;
        assert_eq!(
            session.history.last(),
            Some(&ChatMessage::assistant(format!("Hello there.{INTERRUPTED_MARKER}")))
        );
    }

    #[tokio::test]
    async fn test_closed_transport_ends_turn_and_processor() {
        let mut h = Harness::start(
            vec![vec![
                Step::Token("Hello"),
                Step::Token(" world"),
                Step::Delay(Duration::from_millis(200)),
                Step::Token(" again"),
                Step::Delay(Duration::from_secs(30)),
            ]],
            None,
        );

        h.send(final_msg("greet", Some("d1"))).await;
        h.until("llm_partial").await;
        h.until("llm_partial").await;
        h.events.close();

        // The processor stops on its own while the queue is still open
        let Harness { queue, processor, .. } = h;
        let session = tokio::time::timeout(Duration::from_secs(5), processor)
            .await
            .expect("processor did not stop")
            .unwrap();
        drop(queue);

        assert!(!session.turn_in_progress);
        assert!(!session.abort_requested);
        assert_eq!(session.last_committed_turn_id.as_deref(), Some("d1"));
        assert_eq!(
            session.history,
            vec![
                ChatMessage::user("greet"),
                ChatMessage::assistant(format!("Hello world{INTERRUPTED_MARKER}")),
            ]
        );
    }
}
