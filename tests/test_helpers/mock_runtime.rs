use candle_serve::openai::pipelines::{
    ModelInputs, ModelRuntime, RuntimeError, TemplateSource, TokenStreamer,
};
use candle_serve::openai::requests::{Message, MessageContent};
use candle_serve::openai::sampling_params::{GenerationConfig, GenerationDefaults};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub const EOS: u32 = 2;
/// Byte `b` is token `b + BYTE_OFFSET`; ids below it are special tokens.
pub const BYTE_OFFSET: u32 = 10;

/// How the multimodal processor template behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorMode {
    Working,
    Missing,
    /// Fails with an error that is not a processor failure.
    BrokenInput,
}

/// A byte-level model that always answers with a scripted reply.
pub struct MockRuntime {
    reply: String,
    oom_failures: AtomicUsize,
    oom_after: Option<usize>,
    oom_after_pending: AtomicBool,
    fail_after: Option<usize>,
    panics: bool,
    processor: ProcessorMode,
    token_delay: Option<Duration>,
    configs: Mutex<Vec<GenerationConfig>>,
    template_sources: Mutex<Vec<TemplateSource>>,
    releases: AtomicUsize,
    completed: AtomicUsize,
}

impl MockRuntime {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            oom_failures: AtomicUsize::new(0),
            oom_after: None,
            oom_after_pending: AtomicBool::new(false),
            fail_after: None,
            panics: false,
            processor: ProcessorMode::Missing,
            token_delay: None,
            configs: Mutex::new(Vec::new()),
            template_sources: Mutex::new(Vec::new()),
            releases: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }

    /// The first `n` calls to `generate` report device memory exhaustion.
    pub fn with_oom_failures(self, n: usize) -> Self {
        self.oom_failures.store(n, Ordering::SeqCst);
        self
    }

    /// The first call to `generate` runs out of memory after streaming `n`
    /// tokens; later calls succeed.
    pub fn with_oom_after(mut self, n: usize) -> Self {
        self.oom_after = Some(n);
        self.oom_after_pending.store(true, Ordering::SeqCst);
        self
    }

    /// Fail with a model error after producing `n` tokens.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    pub fn with_processor(mut self, mode: ProcessorMode) -> Self {
        self.processor = mode;
        self
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = Some(delay);
        self
    }

    /// Configs passed to `generate`, in call order.
    pub fn configs(&self) -> Vec<GenerationConfig> {
        self.configs.lock().clone()
    }

    pub fn template_sources(&self) -> Vec<TemplateSource> {
        self.template_sources.lock().clone()
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Number of `generate` calls that ran to the end.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    fn encode(text: &str) -> Vec<u32> {
        text.bytes().map(|b| u32::from(b) + BYTE_OFFSET).collect()
    }

    fn render(conversation: &[Message], add_generation_prompt: bool) -> String {
        let mut text = String::new();
        for message in conversation {
            text.push_str(&message.role);
            text.push_str(": ");
            match &message.content {
                MessageContent::Text(content) => text.push_str(content),
                MessageContent::Parts(parts) => {
                    for part in parts {
                        match part.fields.get("text").and_then(|t| t.as_str()) {
                            Some(content) => text.push_str(content),
                            None => text.push_str(&format!("<{}>", part.part_type)),
                        }
                    }
                }
            }
            text.push('\n');
        }
        if add_generation_prompt {
            text.push_str("assistant: ");
        }
        text
    }
}

impl ModelRuntime for MockRuntime {
    fn tokenize(&self, text: &str, _add_special_tokens: bool) -> Result<Vec<u32>, RuntimeError> {
        Ok(Self::encode(text))
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, RuntimeError> {
        let mut bytes = Vec::new();
        for &id in ids {
            if id >= BYTE_OFFSET {
                bytes.push((id - BYTE_OFFSET) as u8);
            } else if !skip_special_tokens {
                bytes.extend_from_slice(if id == EOS { b"</s>" } else { b"<unk>" });
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn apply_chat_template(
        &self,
        source: TemplateSource,
        conversation: &[Message],
        add_generation_prompt: bool,
    ) -> Result<ModelInputs, RuntimeError> {
        self.template_sources.lock().push(source);
        if source == TemplateSource::Processor {
            match self.processor {
                ProcessorMode::Working => {}
                ProcessorMode::Missing => return Err(RuntimeError::ProcessorUnavailable),
                ProcessorMode::BrokenInput => {
                    return Err(RuntimeError::Tokenizer("unreadable image".to_string()))
                }
            }
        }
        Ok(ModelInputs::new(Self::encode(&Self::render(
            conversation,
            add_generation_prompt,
        ))))
    }

    fn generate(
        &self,
        inputs: &ModelInputs,
        config: &GenerationConfig,
        mut streamer: Option<&mut dyn TokenStreamer>,
    ) -> Result<Vec<u32>, RuntimeError> {
        self.configs.lock().push(config.clone());
        if self.panics {
            panic!("mock runtime panicked");
        }
        let oom = self
            .oom_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if oom {
            return Err(RuntimeError::OutOfMemory("CUDA out of memory".to_string()));
        }

        if let Some(s) = streamer.as_deref_mut() {
            s.put(&inputs.input_ids)?;
        }
        let limit = config
            .resolve(&GenerationDefaults::default(), inputs.len())
            .max_new_tokens;
        let mut output = inputs.input_ids.clone();
        for (index, token) in Self::encode(&self.reply).into_iter().take(limit).enumerate() {
            if self.oom_after == Some(index)
                && self.oom_after_pending.swap(false, Ordering::SeqCst)
            {
                return Err(RuntimeError::OutOfMemory("CUDA out of memory".to_string()));
            }
            if self.fail_after == Some(index) {
                return Err(RuntimeError::Model("mock failure".to_string()));
            }
            if let Some(delay) = self.token_delay {
                std::thread::sleep(delay);
            }
            if let Some(s) = streamer.as_deref_mut() {
                s.put(&[token])?;
            }
            output.push(token);
        }
        if let Some(s) = streamer.as_deref_mut() {
            s.end()?;
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(output)
    }

    fn release_cached_memory(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}
