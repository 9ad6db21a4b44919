use super::conversation::ApplyChatTemplateError;
use super::requests::Message;
use super::sampling_params::GenerationConfig;
use std::{env, fs, path::PathBuf};

/// The LLMEngine drives a `ModelRuntime`: it picks the prompt path, applies
/// the out-of-memory retry policy and does the token accounting.
pub mod llm_engine;
pub mod pipeline;

#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("device out of memory: {0}")]
    OutOfMemory(String),
    #[error("no multimodal processor is loaded for this model")]
    ProcessorUnavailable,
    #[error("chat template error: {0}")]
    Template(#[from] ApplyChatTemplateError),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("streamer error: {0}")]
    Streamer(String),
    #[error("model error: {0}")]
    Model(String),
}

impl RuntimeError {
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, RuntimeError::OutOfMemory(_))
    }

    /// Failures that belong to the multimodal processor rather than to the
    /// model or the input.
    pub fn is_processor_failure(&self) -> bool {
        matches!(
            self,
            RuntimeError::ProcessorUnavailable | RuntimeError::Template(_)
        )
    }
}

/// CUDA and Metal report allocation failures with these markers.
fn is_out_of_memory_message(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    msg.contains("out of memory") || msg.contains("out_of_memory")
}

impl From<candle_core::Error> for RuntimeError {
    fn from(err: candle_core::Error) -> Self {
        let msg = err.to_string();
        if is_out_of_memory_message(&msg) {
            RuntimeError::OutOfMemory(msg)
        } else {
            RuntimeError::Model(msg)
        }
    }
}

impl From<tokenizers::Error> for RuntimeError {
    fn from(err: tokenizers::Error) -> Self {
        RuntimeError::Tokenizer(err.to_string())
    }
}

/// Which template renders a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateSource {
    /// The tokenizer's text-only chat template.
    Tokenizer,
    /// The multimodal processor's template.
    Processor,
}

/// Token ids ready for `generate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInputs {
    pub input_ids: Vec<u32>,
}

impl ModelInputs {
    pub fn new(input_ids: Vec<u32>) -> Self {
        Self { input_ids }
    }

    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Receives tokens while `generate` runs. The runtime first puts the whole
/// prompt, then each new token, then calls `end` once.
pub trait TokenStreamer: Send {
    fn put(&mut self, tokens: &[u32]) -> Result<(), RuntimeError>;
    fn end(&mut self) -> Result<(), RuntimeError>;
    /// Called before a retried generation reuses this streamer.
    fn reset(&mut self) {}
}

/// Everything the engine needs from a loaded model.
pub trait ModelRuntime: Send + Sync {
    fn tokenize(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>, RuntimeError>;

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, RuntimeError>;

    fn apply_chat_template(
        &self,
        source: TemplateSource,
        conversation: &[Message],
        add_generation_prompt: bool,
    ) -> Result<ModelInputs, RuntimeError>;

    /// Run generation to completion and return the prompt followed by the
    /// new tokens.
    fn generate(
        &self,
        inputs: &ModelInputs,
        config: &GenerationConfig,
        streamer: Option<&mut dyn TokenStreamer>,
    ) -> Result<Vec<u32>, RuntimeError>;

    /// Give cached device allocations back before a retry.
    fn release_cached_memory(&self) {}
}

/// Resolve a Hugging Face token. `None` means anonymous hub access.
pub(crate) fn get_token(
    hf_token: Option<String>,
    hf_token_path: Option<String>,
) -> anyhow::Result<Option<String>> {
    Ok(match (hf_token, hf_token_path) {
        (Some(envvar), None) => Some(env::var(envvar)?.trim().to_string()),
        (None, Some(path)) => Some(fs::read_to_string(path)?.trim().to_string()),
        (None, None) => {
            let cached = dirs::home_dir()
                .map(|home| home.join(".cache").join("huggingface").join("token"))
                .filter(|p: &PathBuf| p.exists());
            match cached {
                Some(path) => Some(fs::read_to_string(path)?.trim().to_string()),
                None => None,
            }
        }
        _ => anyhow::bail!("Do not specify `hf_token` and `hf_token_path` at the same time."),
    })
}
