use super::{get_token, ModelInputs, ModelRuntime, RuntimeError, TemplateSource, TokenStreamer};
use crate::config::ModelSettings;
use crate::openai::conversation::ChatTemplate;
use crate::openai::requests::Message;
use crate::openai::sampling_params::{GenerationConfig, GenerationDefaults, ResolvedSampling};
use crate::openai::TokenizerConfig;
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig, LlamaEosToks};
use hf_hub::{api::sync::ApiBuilder, Repo, RepoType};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokenizers::Tokenizer;
use tracing::{info, warn};

/// Stop strings are matched against the decoded text of this many trailing
/// tokens, or more when a stop string is longer.
const STOP_STRING_WINDOW: usize = 8;

/// A Llama-family causal LM on candle. Greedy, top-k and top-p sampling are
/// implemented; beam search is not.
pub struct DefaultPipeline {
    model: Llama,
    config: Config,
    tokenizer: Tokenizer,
    chat_template: ChatTemplate,
    processor_template: Option<ChatTemplate>,
    defaults: GenerationDefaults,
    eos_token_ids: Vec<u32>,
    name: String,
    dtype: DType,
    device: Device,
}

pub struct DefaultLoader {
    model_path: String,
    revision: Option<String>,
    hf_token: Option<String>,
    hf_token_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DefaultModelPaths {
    pub tokenizer_filename: PathBuf,
    pub tokenizer_config_filename: Option<PathBuf>,
    pub config_filename: PathBuf,
    pub generation_config_filename: Option<PathBuf>,
    pub processor_template_filename: Option<PathBuf>,
    pub filenames: Vec<PathBuf>,
}

fn existing(path: PathBuf) -> Option<PathBuf> {
    path.exists().then_some(path)
}

impl DefaultLoader {
    pub fn new(settings: &ModelSettings) -> Self {
        Self {
            model_path: settings.model_path.clone(),
            revision: settings.revision.clone(),
            hf_token: settings.hf_token.clone(),
            hf_token_path: settings.hf_token_path.clone(),
        }
    }

    /// Resolve files from a local model directory, or from the hub when
    /// `model_path` is not a directory.
    pub fn prepare_model_weights(&self) -> Result<DefaultModelPaths> {
        let path = Path::new(&self.model_path);
        if !path.is_dir() {
            info!("{} is not a local directory, fetching it from the hub", self.model_path);
            return self.download_model();
        }
        let filenames = if path.join("model.safetensors.index.json").exists() {
            crate::hub_load_local_safetensors(path, "model.safetensors.index.json")?
        } else {
            vec![path.join("model.safetensors")]
        };
        let processor_template_filename = existing(path.join("chat_template.json"))
            .or_else(|| existing(path.join("chat_template.jinja")));
        Ok(DefaultModelPaths {
            tokenizer_filename: path.join("tokenizer.json"),
            tokenizer_config_filename: existing(path.join("tokenizer_config.json")),
            config_filename: path.join("config.json"),
            generation_config_filename: existing(path.join("generation_config.json")),
            processor_template_filename,
            filenames,
        })
    }

    pub fn download_model(&self) -> Result<DefaultModelPaths> {
        let token = get_token(self.hf_token.clone(), self.hf_token_path.clone())
            .map_err(candle_core::Error::msg)?;
        let api = ApiBuilder::new()
            .with_progress(true)
            .with_token(token)
            .build()
            .map_err(candle_core::Error::wrap)?;
        let revision = self.revision.clone().unwrap_or("main".to_string());
        let api = api.repo(Repo::with_revision(
            self.model_path.clone(),
            RepoType::Model,
            revision,
        ));

        let tokenizer_filename = api
            .get("tokenizer.json")
            .map_err(candle_core::Error::wrap)?;
        let config_filename = api.get("config.json").map_err(candle_core::Error::wrap)?;

        let mut filenames = vec![];
        let mut siblings = vec![];
        for rfilename in api
            .info()
            .map_err(candle_core::Error::wrap)?
            .siblings
            .iter()
            .map(|x| x.rfilename.clone())
        {
            if rfilename.ends_with(".safetensors") {
                filenames.push(api.get(&rfilename).map_err(candle_core::Error::wrap)?);
            }
            siblings.push(rfilename);
        }
        let optional = |name: &str| {
            if siblings.iter().any(|s| s == name) {
                api.get(name).ok()
            } else {
                None
            }
        };

        Ok(DefaultModelPaths {
            tokenizer_filename,
            tokenizer_config_filename: optional("tokenizer_config.json"),
            config_filename,
            generation_config_filename: optional("generation_config.json"),
            processor_template_filename: optional("chat_template.json")
                .or_else(|| optional("chat_template.jinja")),
            filenames,
        })
    }

    pub fn load_model(
        &self,
        paths: DefaultModelPaths,
        dtype: DType,
        device: Device,
    ) -> Result<DefaultPipeline> {
        let config: LlamaConfig =
            serde_json::from_slice(&std::fs::read(&paths.config_filename)?)
                .map_err(candle_core::Error::wrap)?;
        let config = config.into_config(cfg!(feature = "flash-attn"));

        info!(
            "Loading {} weight file(s) as {:?} on {:?}",
            paths.filenames.len(),
            dtype,
            device
        );
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&paths.filenames, dtype, &device)? };
        let model = Llama::load(vb, &config)?;

        let tokenizer =
            Tokenizer::from_file(&paths.tokenizer_filename).map_err(candle_core::Error::msg)?;

        let tokenizer_cfg = match &paths.tokenizer_config_filename {
            Some(file) => Some(
                serde_json::from_slice::<TokenizerConfig>(&std::fs::read(file)?)
                    .map_err(candle_core::Error::wrap)?,
            ),
            None => None,
        };
        let bos = tokenizer_cfg
            .as_ref()
            .and_then(|cfg| cfg.bos_token.as_ref())
            .and_then(|t| t.content());
        let eos = tokenizer_cfg
            .as_ref()
            .and_then(|cfg| cfg.eos_token.as_ref())
            .and_then(|t| t.content());

        let chat_template = match tokenizer_cfg
            .as_ref()
            .and_then(|cfg| cfg.chat_template.as_ref())
            .and_then(|t| t.default_template())
        {
            Some(template) => ChatTemplate::new("tokenizer", template, bos.clone(), eos.clone()),
            None => {
                warn!("Chat template not found in tokenizer_config.json, falling back to ChatML");
                ChatTemplate::chatml(bos.clone(), eos.clone())
            }
        };

        let processor_template = match &paths.processor_template_filename {
            Some(file) => Some(ChatTemplate::new(
                "processor",
                read_processor_template(file)?,
                bos.clone(),
                eos.clone(),
            )),
            None => None,
        };

        let defaults = match &paths.generation_config_filename {
            Some(file) => serde_json::from_slice(&std::fs::read(file)?)
                .map_err(candle_core::Error::wrap)?,
            None => GenerationDefaults::default(),
        };

        let mut eos_token_ids = match &config.eos_token_id {
            Some(LlamaEosToks::Single(id)) => vec![*id],
            Some(LlamaEosToks::Multiple(ids)) => ids.clone(),
            None => vec![],
        };
        if let Some(id) = eos.as_deref().and_then(|t| tokenizer.token_to_id(t)) {
            if !eos_token_ids.contains(&id) {
                eos_token_ids.push(id);
            }
        }
        if eos_token_ids.is_empty() {
            warn!("No end-of-sequence token found, generation stops only at the length limit");
        }

        let name = self
            .model_path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        info!("Model {name} loaded, eos tokens {:?}, defaults {:?}", eos_token_ids, defaults);

        Ok(DefaultPipeline {
            model,
            config,
            tokenizer,
            chat_template,
            processor_template,
            defaults,
            eos_token_ids,
            name,
            dtype,
            device,
        })
    }

    /// Resolve, read and load in one step.
    pub fn load(&self, device: &str, precision: &str) -> Result<DefaultPipeline> {
        let device = crate::new_device(device)?;
        let dtype = crate::parse_dtype(precision, &device)?;
        let paths = self.prepare_model_weights()?;
        self.load_model(paths, dtype, device)
    }
}

/// `chat_template.json` wraps the template in an object; `.jinja` files are raw.
fn read_processor_template(file: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(file)?;
    if file.extension().is_some_and(|ext| ext == "jinja") {
        return Ok(raw);
    }
    let value: serde_json::Value = serde_json::from_str(&raw).map_err(candle_core::Error::wrap)?;
    value
        .get("chat_template")
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .ok_or_else(|| candle_core::Error::msg(format!("no chat_template in {}", file.display())))
}

fn sampling_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(299792458)
}

impl DefaultPipeline {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn template(&self, source: TemplateSource) -> Result<&ChatTemplate, RuntimeError> {
        match source {
            TemplateSource::Tokenizer => Ok(&self.chat_template),
            TemplateSource::Processor => self
                .processor_template
                .as_ref()
                .ok_or(RuntimeError::ProcessorUnavailable),
        }
    }

    fn hit_stop_string(&self, generated: &[u32], sampling: &ResolvedSampling) -> Result<bool, RuntimeError> {
        if sampling.stop_strings.is_empty() {
            return Ok(false);
        }
        let longest = sampling.stop_strings.iter().map(|s| s.len()).max().unwrap_or(0);
        let window = generated.len().min(STOP_STRING_WINDOW.max(longest));
        let tail = self
            .tokenizer
            .decode(&generated[generated.len() - window..], true)?;
        Ok(sampling.stop_strings.iter().any(|s| tail.contains(s.as_str())))
    }

    fn forward(
        &self,
        tokens: &[u32],
        index_pos: usize,
        cache: &mut Cache,
    ) -> Result<Tensor> {
        let input = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input, index_pos, cache)?;
        logits.squeeze(0)?.to_dtype(DType::F32)
    }
}

impl ModelRuntime for DefaultPipeline {
    fn tokenize(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>, RuntimeError> {
        let encoding = self.tokenizer.encode(text, add_special_tokens)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, RuntimeError> {
        Ok(self.tokenizer.decode(ids, skip_special_tokens)?)
    }

    fn apply_chat_template(
        &self,
        source: TemplateSource,
        conversation: &[Message],
        add_generation_prompt: bool,
    ) -> Result<ModelInputs, RuntimeError> {
        let prompt = self
            .template(source)?
            .render(conversation, add_generation_prompt)?;
        // The rendered template already carries the special tokens it needs.
        Ok(ModelInputs::new(self.tokenize(&prompt, false)?))
    }

    fn generate(
        &self,
        inputs: &ModelInputs,
        config: &GenerationConfig,
        mut streamer: Option<&mut dyn TokenStreamer>,
    ) -> Result<Vec<u32>, RuntimeError> {
        let sampling = config.resolve(&self.defaults, inputs.len());
        if sampling.num_beams > 1 {
            warn!(
                "num_beams={} requested, beam search is not supported; decoding a single sequence",
                sampling.num_beams
            );
        }
        if let Some(s) = streamer.as_deref_mut() {
            s.put(&inputs.input_ids)?;
        }

        // Without a resident cache every step recomputes the whole context.
        let use_kv_cache = !sampling.offloaded;
        let mut cache = Cache::new(use_kv_cache, self.dtype, &self.config, &self.device)?;
        let mut logits_processor = LogitsProcessor::from_sampling(sampling_seed(), sampling.sampling());

        let mut tokens = inputs.input_ids.clone();
        let prompt_len = tokens.len();
        let max_len = self.config.max_position_embeddings;
        let mut index_pos = 0;
        for step in 0..sampling.max_new_tokens {
            if tokens.len() >= max_len {
                warn!("Reached the model context length {max_len}, stopping generation");
                break;
            }
            let (context, start) = if use_kv_cache && step > 0 {
                (&tokens[tokens.len() - 1..], index_pos)
            } else {
                (&tokens[..], 0)
            };
            let logits = self.forward(context, start, &mut cache)?;
            index_pos = start + context.len();

            let logits = if sampling.repetition_penalty == 1.0 {
                logits
            } else {
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    sampling.repetition_penalty,
                    &tokens,
                )?
            };
            let next_token = logits_processor.sample(&logits)?;
            tokens.push(next_token);
            if let Some(s) = streamer.as_deref_mut() {
                s.put(&[next_token])?;
            }

            if self.eos_token_ids.contains(&next_token)
                || self.hit_stop_string(&tokens[prompt_len..], &sampling)?
            {
                break;
            }
        }

        if let Some(s) = streamer.as_deref_mut() {
            s.end()?;
        }
        Ok(tokens)
    }

    fn release_cached_memory(&self) {
        if let Err(e) = self.device.synchronize() {
            warn!("Failed to synchronize {:?} before releasing memory: {e}", self.device);
        }
    }
}
