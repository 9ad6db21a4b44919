use super::{ModelInputs, ModelRuntime, RuntimeError, TemplateSource, TokenStreamer};
use crate::config::LogSettings;
use crate::openai::requests::{self, Message};
use crate::openai::sampling_params::{CacheImplementation, GenerationConfig};
use std::sync::Arc;
use tracing::{info, warn};

/// A finished, non-streamed generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// Result of one generation attempt, as seen by the retry policy.
#[derive(Debug)]
pub enum GenerationOutcome {
    Success(Vec<u32>),
    ResourceExhausted(RuntimeError),
    Failure(RuntimeError),
}

impl From<Result<Vec<u32>, RuntimeError>> for GenerationOutcome {
    fn from(result: Result<Vec<u32>, RuntimeError>) -> Self {
        match result {
            Ok(ids) => GenerationOutcome::Success(ids),
            Err(e) if e.is_out_of_memory() => GenerationOutcome::ResourceExhausted(e),
            Err(e) => GenerationOutcome::Failure(e),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),
    #[error("Inference engine is not available or not yet initialized.")]
    EngineUnavailable,
    #[error("{0}")]
    GenerationFailure(#[source] RuntimeError),
    #[error("stream failed: {0}")]
    StreamFailure(String),
}

fn reborrow<'a>(
    streamer: &'a mut Option<&mut dyn TokenStreamer>,
) -> Option<&'a mut dyn TokenStreamer> {
    match streamer {
        Some(s) => Some(&mut **s),
        None => None,
    }
}

/// Turns prompts and conversations into generated text on top of a
/// `ModelRuntime`. Holds no per-request state; every call is independent
/// and runs synchronously on the caller's thread.
pub struct LLMEngine {
    runtime: Arc<dyn ModelRuntime>,
    log: LogSettings,
}

impl LLMEngine {
    pub fn new(runtime: Arc<dyn ModelRuntime>, log: LogSettings) -> Self {
        Self { runtime, log }
    }

    pub fn runtime(&self) -> &Arc<dyn ModelRuntime> {
        &self.runtime
    }

    pub fn is_multimodal(conversation: &[Message]) -> bool {
        requests::is_multimodal(conversation)
    }

    /// Token ids for a conversation. Multimodal conversations go through the
    /// processor template; when the processor is missing or cannot render the
    /// conversation the tokenizer template is used instead.
    pub fn apply_chat_template(
        &self,
        conversation: &[Message],
        add_generation_prompt: bool,
    ) -> Result<ModelInputs, EngineError> {
        if Self::is_multimodal(conversation) {
            match self.runtime.apply_chat_template(
                TemplateSource::Processor,
                conversation,
                add_generation_prompt,
            ) {
                Ok(inputs) => return Ok(inputs),
                Err(e) if e.is_processor_failure() => {
                    warn!("Processor template failed ({e}), falling back to the tokenizer template");
                }
                Err(e) => return Err(EngineError::GenerationFailure(e)),
            }
        }
        self.runtime
            .apply_chat_template(TemplateSource::Tokenizer, conversation, add_generation_prompt)
            .map_err(EngineError::GenerationFailure)
    }

    /// Generate with one retry under an offloaded cache when the device runs
    /// out of memory.
    fn resilient_generate(
        &self,
        inputs: &ModelInputs,
        config: &GenerationConfig,
        mut streamer: Option<&mut dyn TokenStreamer>,
    ) -> Result<Vec<u32>, EngineError> {
        let first = GenerationOutcome::from(self.runtime.generate(
            inputs,
            config,
            reborrow(&mut streamer),
        ));
        let err = match first {
            GenerationOutcome::Success(ids) => return Ok(ids),
            GenerationOutcome::Failure(e) => return Err(EngineError::GenerationFailure(e)),
            GenerationOutcome::ResourceExhausted(e) => e,
        };

        warn!("{err}; releasing cached device memory and retrying with an offloaded cache");
        self.runtime.release_cached_memory();
        if let Some(s) = reborrow(&mut streamer) {
            s.reset();
        }
        let retry_config = config.with_cache_implementation(CacheImplementation::Offloaded);
        match GenerationOutcome::from(self.runtime.generate(inputs, &retry_config, streamer)) {
            GenerationOutcome::Success(ids) => Ok(ids),
            GenerationOutcome::ResourceExhausted(e) | GenerationOutcome::Failure(e) => {
                Err(EngineError::GenerationFailure(e))
            }
        }
    }

    /// Run generation and split the output into prompt and completion.
    fn finish(
        &self,
        inputs: &ModelInputs,
        config: &GenerationConfig,
        streamer: Option<&mut dyn TokenStreamer>,
    ) -> Result<Generation, EngineError> {
        if self.log.params {
            info!(config = ?config, "Generation config");
        }
        let output = self.resilient_generate(inputs, config, streamer)?;
        let prompt_tokens = inputs.len();
        let completion = output.get(prompt_tokens..).unwrap_or_default();
        let text = self
            .runtime
            .decode(completion, true)
            .map_err(EngineError::GenerationFailure)?;
        if self.log.completion {
            info!(completion = %text, "Completion");
        }
        Ok(Generation {
            text,
            prompt_tokens,
            completion_tokens: completion.len(),
        })
    }

    pub fn generate_completion(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        streamer: Option<&mut dyn TokenStreamer>,
    ) -> Result<Generation, EngineError> {
        if self.log.prompt {
            info!(prompt = %prompt, "Prompt");
        }
        let inputs = ModelInputs::new(
            self.runtime
                .tokenize(prompt, true)
                .map_err(EngineError::GenerationFailure)?,
        );
        self.finish(&inputs, config, streamer)
    }

    pub fn generate_chat_completion(
        &self,
        conversation: &[Message],
        config: &GenerationConfig,
        streamer: Option<&mut dyn TokenStreamer>,
    ) -> Result<Generation, EngineError> {
        if self.log.prompt {
            info!(messages = ?conversation, "Prompt");
        }
        let inputs = self.apply_chat_template(conversation, true)?;
        self.finish(&inputs, config, streamer)
    }

    pub fn tokenize(&self, text: &str) -> Result<Vec<u32>, EngineError> {
        self.runtime
            .tokenize(text, true)
            .map_err(EngineError::GenerationFailure)
    }

    pub fn detokenize(&self, ids: &[u32]) -> Result<String, EngineError> {
        self.runtime
            .decode(ids, false)
            .map_err(EngineError::GenerationFailure)
    }

    /// Number of tokens in generated text, without added special tokens.
    pub fn count_tokens(&self, text: &str) -> Result<usize, EngineError> {
        self.runtime
            .tokenize(text, false)
            .map(|ids| ids.len())
            .map_err(EngineError::GenerationFailure)
    }
}
