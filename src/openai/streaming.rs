use super::pipelines::llm_engine::{EngineError, Generation, LLMEngine};
use super::pipelines::{ModelRuntime, RuntimeError, TokenStreamer};
use super::requests::{ChatCompletionRequest, CompletionRequest, Message};
use super::responses::{
    new_response_id, ChatCompletionResponse, CompletionResponse, FinishReason, UsageInfo,
};
use super::sampling_params::GenerationConfig;
use super::utils::get_created_time_secs;
use axum::response::sse::Event;
use flume::{Receiver, Sender};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub type SseStream = Pin<Box<dyn Stream<Item = Result<Event, axum::Error>> + Send>>;

/// What the generation thread hands to the response side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Fragment(String),
    Terminal(FinishReason),
}

/// The two request kinds a stream can be started for.
#[derive(Debug, Clone)]
pub enum GenerationInput {
    Completion(String),
    Chat(Vec<Message>),
}

impl GenerationInput {
    fn run(
        &self,
        engine: &LLMEngine,
        config: &GenerationConfig,
        streamer: &mut dyn TokenStreamer,
    ) -> Result<Generation, EngineError> {
        match self {
            GenerationInput::Completion(prompt) => {
                engine.generate_completion(prompt, config, Some(streamer))
            }
            GenerationInput::Chat(messages) => {
                engine.generate_chat_completion(messages, config, Some(streamer))
            }
        }
    }

    /// Prompt length, recounted from the request input.
    pub fn count_prompt_tokens(&self, engine: &LLMEngine) -> Result<usize, EngineError> {
        match self {
            GenerationInput::Completion(prompt) => engine.tokenize(prompt).map(|ids| ids.len()),
            GenerationInput::Chat(messages) => engine
                .apply_chat_template(messages, true)
                .map(|inputs| inputs.len()),
        }
    }
}

// ============================================================================
// Producer side
// ============================================================================

/// Decodes tokens as they are generated and pushes the new text into a
/// channel. The first `put` (the prompt) is skipped when `skip_prompt` is set;
/// special tokens never reach the output. Text is held back while the
/// decoded tail is an incomplete UTF-8 sequence.
///
/// After a `reset`, the text a retried generation reproduces is not sent
/// again: only what goes beyond the bytes already sent reaches the channel.
pub struct TextIteratorStreamer {
    runtime: Arc<dyn ModelRuntime>,
    sender: Sender<StreamEvent>,
    skip_prompt: bool,
    next_is_prompt: bool,
    token_ids: Vec<u32>,
    prefix_offset: usize,
    read_offset: usize,
    /// Everything sent so far, across attempts.
    sent: String,
    /// Text decoded by the current attempt.
    produced: String,
    diverged: bool,
}

impl TextIteratorStreamer {
    pub fn new(runtime: Arc<dyn ModelRuntime>, sender: Sender<StreamEvent>, skip_prompt: bool) -> Self {
        Self {
            runtime,
            sender,
            skip_prompt,
            next_is_prompt: true,
            token_ids: Vec::new(),
            prefix_offset: 0,
            read_offset: 0,
            sent: String::new(),
            produced: String::new(),
            diverged: false,
        }
    }

    fn emit(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.produced.push_str(text);
        let Some(unsent) = self.produced.get(self.sent.len()..) else {
            // Still inside text a previous attempt already sent.
            return;
        };
        if unsent.is_empty() {
            return;
        }
        if !self.diverged && !self.produced.starts_with(self.sent.as_str()) {
            self.diverged = true;
            warn!("Retried generation diverged from the text already streamed");
        }
        let unsent = unsent.to_string();
        self.sent.push_str(&unsent);
        // A closed channel means the client went away; generation continues.
        if self.sender.send(StreamEvent::Fragment(unsent)).is_err() {
            debug!("Stream receiver dropped, discarding fragment");
        }
    }

    /// Text decoded since the last emission, if it can be emitted now.
    fn pending_text(&self, flush: bool) -> Result<Option<String>, RuntimeError> {
        let prefix_text = self
            .runtime
            .decode(&self.token_ids[self.prefix_offset..self.read_offset], true)?;
        let new_text = self
            .runtime
            .decode(&self.token_ids[self.prefix_offset..], true)?;
        if new_text.len() <= prefix_text.len() || (!flush && new_text.ends_with('\u{FFFD}')) {
            return Ok(None);
        }
        Ok(new_text.get(prefix_text.len()..).map(str::to_string))
    }
}

impl TokenStreamer for TextIteratorStreamer {
    fn put(&mut self, tokens: &[u32]) -> Result<(), RuntimeError> {
        if std::mem::take(&mut self.next_is_prompt) && self.skip_prompt {
            return Ok(());
        }
        self.token_ids.extend_from_slice(tokens);
        if let Some(text) = self.pending_text(false)? {
            self.emit(&text);
            self.prefix_offset = self.read_offset;
            self.read_offset = self.token_ids.len();
        }
        Ok(())
    }

    fn end(&mut self) -> Result<(), RuntimeError> {
        if let Some(text) = self.pending_text(true)? {
            self.emit(&text);
        }
        self.prefix_offset = self.token_ids.len();
        self.read_offset = self.token_ids.len();
        Ok(())
    }

    fn reset(&mut self) {
        self.next_is_prompt = true;
        self.token_ids.clear();
        self.prefix_offset = 0;
        self.read_offset = 0;
        self.produced.clear();
    }
}

// ============================================================================
// Consumer side
// ============================================================================

/// Fragments of one generation running on the blocking pool.
///
/// Dropping an unfinished stream hands the worker to a background task that
/// waits for it, so a generation is always joined.
pub struct GenerationStream {
    receiver: Receiver<StreamEvent>,
    worker: Option<JoinHandle<()>>,
}

impl GenerationStream {
    /// Start generating on the blocking pool. Must be called within a tokio runtime.
    pub fn spawn(engine: Arc<LLMEngine>, input: GenerationInput, config: GenerationConfig) -> Self {
        let (sender, receiver) = flume::unbounded();
        let worker = tokio::task::spawn_blocking(move || {
            let mut streamer =
                TextIteratorStreamer::new(engine.runtime().clone(), sender.clone(), true);
            let reason = match input.run(&engine, &config, &mut streamer) {
                Ok(_) => FinishReason::Stop,
                Err(e) => {
                    error!("Generation failed while streaming: {e}");
                    FinishReason::Error
                }
            };
            let _ = sender.send(StreamEvent::Terminal(reason));
        });
        Self {
            receiver,
            worker: Some(worker),
        }
    }

    /// Next event, or `None` once the producer is gone.
    pub async fn next_event(&self) -> Option<StreamEvent> {
        self.receiver.recv_async().await.ok()
    }

    /// Wait for the generation thread to finish.
    pub async fn join(&mut self) -> Result<(), EngineError> {
        match self.worker.take() {
            Some(worker) => worker
                .await
                .map_err(|e| EngineError::StreamFailure(e.to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        debug!("Stream abandoned before generation finished, reaping worker");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = worker.await {
                        warn!("Abandoned generation ended abnormally: {e}");
                    }
                });
            }
            // The blocking pool still runs the task to completion.
            Err(_) => drop(worker),
        }
    }
}

// ============================================================================
// SSE assembly
// ============================================================================

/// Envelope fields shared by every chunk of one response.
struct ChunkShape {
    id: String,
    created: u64,
    model: Option<String>,
    chat: bool,
}

impl ChunkShape {
    fn event(
        &self,
        text: String,
        finish_reason: Option<FinishReason>,
        usage: Option<UsageInfo>,
    ) -> Result<Event, axum::Error> {
        let (id, model) = (self.id.clone(), self.model.clone());
        if self.chat {
            Event::default().json_data(ChatCompletionResponse::chunk(
                id,
                self.created,
                model,
                text,
                finish_reason,
                usage,
            ))
        } else {
            Event::default().json_data(CompletionResponse::new(
                id,
                self.created,
                model,
                text,
                finish_reason,
                usage,
            ))
        }
    }
}

/// Usage for a finished stream. A count that cannot be recomputed is
/// reported as zero rather than failing the stream.
fn stream_usage(engine: &LLMEngine, input: &GenerationInput, text: &str) -> UsageInfo {
    let prompt_tokens = input.count_prompt_tokens(engine).unwrap_or_else(|e| {
        warn!("Could not count prompt tokens for usage: {e}");
        0
    });
    let completion_tokens = engine.count_tokens(text).unwrap_or_else(|e| {
        warn!("Could not count completion tokens for usage: {e}");
        0
    });
    UsageInfo::new(prompt_tokens, completion_tokens)
}

fn event_stream(
    engine: Arc<LLMEngine>,
    input: GenerationInput,
    config: GenerationConfig,
    shape: ChunkShape,
) -> SseStream {
    Box::pin(async_stream::stream! {
        let mut generation = GenerationStream::spawn(engine.clone(), input.clone(), config);
        let mut finish_reason = None;
        let mut all_text = String::new();

        while let Some(event) = generation.next_event().await {
            match event {
                StreamEvent::Fragment(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    all_text.push_str(&text);
                    yield shape.event(text, None, None);
                }
                StreamEvent::Terminal(reason) => {
                    finish_reason = Some(reason);
                    break;
                }
            }
        }

        if let Err(e) = generation.join().await {
            error!("{e}");
            if finish_reason.is_none() {
                finish_reason = Some(FinishReason::Error);
            }
        }
        // A producer that vanished without a terminal event failed.
        let finish_reason = finish_reason.unwrap_or(FinishReason::Error);
        let usage = {
            let (engine, input, text) = (engine.clone(), input.clone(), all_text.clone());
            tokio::task::spawn_blocking(move || stream_usage(&engine, &input, &text))
                .await
                .unwrap_or_else(|e| {
                    warn!("Usage counting task failed: {e}");
                    UsageInfo::new(0, 0)
                })
        };
        yield shape.event(String::new(), Some(finish_reason), Some(usage));
        yield Ok(Event::default().data("[DONE]"));
    })
}

pub fn completion_stream(engine: Arc<LLMEngine>, request: CompletionRequest) -> SseStream {
    let shape = ChunkShape {
        id: new_response_id(),
        created: get_created_time_secs(),
        model: request.model.clone(),
        chat: false,
    };
    let config = request.gen_config();
    event_stream(engine, GenerationInput::Completion(request.prompt), config, shape)
}

pub fn chat_completion_stream(engine: Arc<LLMEngine>, request: ChatCompletionRequest) -> SseStream {
    let shape = ChunkShape {
        id: new_response_id(),
        created: get_created_time_secs(),
        model: request.model.clone(),
        chat: true,
    };
    let config = request.gen_config();
    event_stream(engine, GenerationInput::Chat(request.messages), config, shape)
}
