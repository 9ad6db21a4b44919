use candle_transformers::generation::Sampling;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopTokens {
    Multi(Vec<String>),
    Single(String),
}

impl StopTokens {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StopTokens::Multi(v) => v.clone(),
            StopTokens::Single(s) => vec![s.clone()],
        }
    }
}

/// KV cache strategy requested from the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheImplementation {
    /// Keep the attention cache resident on the device.
    Dynamic,
    /// Do not keep a resident cache; the runtime trades compute for memory.
    Offloaded,
}

/// Sampling fields of an OpenAI-style request.
///
/// Fields carry their canonical names in Rust; on the wire they use the
/// OpenAI names (`max_tokens`, `max_completion_tokens`, `stop`) and accept
/// the canonical names as aliases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Samplers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub do_sample: Option<bool>,
    #[serde(
        rename = "max_tokens",
        alias = "max_length",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_length: Option<usize>,
    #[serde(
        rename = "max_completion_tokens",
        alias = "max_new_tokens",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_new_tokens: Option<usize>,
    #[serde(
        rename = "stop",
        alias = "stop_strings",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stop_strings: Option<StopTokens>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_beams: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_beam_groups: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,
}

impl Samplers {
    /// Canonical generation configuration: only the fields the caller set.
    pub fn gen_config(&self) -> GenerationConfig {
        GenerationConfig {
            do_sample: self.do_sample,
            max_length: self.max_length,
            max_new_tokens: self.max_new_tokens,
            stop_strings: self.stop_strings.as_ref().map(StopTokens::to_vec),
            num_beams: self.num_beams,
            num_beam_groups: self.num_beam_groups,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            repetition_penalty: self.repetition_penalty,
            cache_implementation: None,
        }
    }
}

/// Generation configuration handed to the runtime. Unset fields are left to
/// the runtime's own defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub do_sample: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_strings: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_beams: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_beam_groups: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_implementation: Option<CacheImplementation>,
}

impl GenerationConfig {
    pub fn with_cache_implementation(&self, cache: CacheImplementation) -> Self {
        Self {
            cache_implementation: Some(cache),
            ..self.clone()
        }
    }

    /// Fill every unset field from `defaults`.
    pub fn resolve(&self, defaults: &GenerationDefaults, prompt_len: usize) -> ResolvedSampling {
        let max_length = self.max_length.unwrap_or(defaults.max_length);
        let max_new_tokens = match self.max_new_tokens.or(defaults.max_new_tokens) {
            Some(n) => n,
            // A prompt at or past `max_length` still yields one token.
            None => max_length.saturating_sub(prompt_len).max(1),
        };
        ResolvedSampling {
            do_sample: self.do_sample.unwrap_or(defaults.do_sample),
            max_new_tokens,
            stop_strings: self.stop_strings.clone().unwrap_or_default(),
            num_beams: self.num_beams.unwrap_or(1),
            temperature: self.temperature.unwrap_or(defaults.temperature),
            top_p: self.top_p.unwrap_or(defaults.top_p),
            top_k: self.top_k.unwrap_or(defaults.top_k),
            repetition_penalty: self
                .repetition_penalty
                .unwrap_or(defaults.repetition_penalty),
            offloaded: self.cache_implementation == Some(CacheImplementation::Offloaded),
        }
    }
}

fn default_do_sample() -> bool {
    true
}

fn default_max_length() -> usize {
    2048
}

fn default_one() -> f32 {
    1.0
}

fn default_top_k() -> usize {
    50
}

/// `generation_config.json` as written. Absent and `null` fields both fall
/// back to the built-in defaults.
#[derive(Debug, Default, Deserialize)]
struct RawGenerationDefaults {
    #[serde(default)]
    do_sample: Option<bool>,
    #[serde(default)]
    max_length: Option<usize>,
    #[serde(default)]
    max_new_tokens: Option<usize>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    top_p: Option<f32>,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    repetition_penalty: Option<f32>,
}

/// Model-side defaults, as found in `generation_config.json`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawGenerationDefaults")]
pub struct GenerationDefaults {
    pub do_sample: bool,
    pub max_length: usize,
    pub max_new_tokens: Option<usize>,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: usize,
    pub repetition_penalty: f32,
}

impl From<RawGenerationDefaults> for GenerationDefaults {
    fn from(raw: RawGenerationDefaults) -> Self {
        Self {
            do_sample: raw.do_sample.unwrap_or_else(default_do_sample),
            max_length: raw.max_length.unwrap_or_else(default_max_length),
            max_new_tokens: raw.max_new_tokens,
            temperature: raw.temperature.unwrap_or_else(default_one),
            top_p: raw.top_p.unwrap_or_else(default_one),
            top_k: raw.top_k.unwrap_or_else(default_top_k),
            repetition_penalty: raw.repetition_penalty.unwrap_or_else(default_one),
        }
    }
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        RawGenerationDefaults::default().into()
    }
}

/// A generation configuration with every value decided.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSampling {
    pub do_sample: bool,
    pub max_new_tokens: usize,
    pub stop_strings: Vec<String>,
    pub num_beams: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: usize,
    pub repetition_penalty: f32,
    pub offloaded: bool,
}

impl ResolvedSampling {
    /// Sampling strategy for candle's `LogitsProcessor`. A top-k of 0 and a
    /// top-p of 1.0 or more disable the respective filter.
    pub fn sampling(&self) -> Sampling {
        if !self.do_sample || self.temperature < 1e-7 {
            return Sampling::ArgMax;
        }
        let temperature = f64::from(self.temperature);
        let top_p = f64::from(self.top_p);
        match (self.top_k, top_p < 1.0) {
            (0, false) => Sampling::All { temperature },
            (0, true) => Sampling::TopP { p: top_p, temperature },
            (k, false) => Sampling::TopK { k, temperature },
            (k, true) => Sampling::TopKThenTopP {
                k,
                p: top_p,
                temperature,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_names_map_to_canonical_fields() {
        let samplers: Samplers = serde_json::from_str(
            r#"{"max_tokens": 16, "max_completion_tokens": 4, "stop": "\n"}"#,
        )
        .unwrap();
        assert_eq!(samplers.max_length, Some(16));
        assert_eq!(samplers.max_new_tokens, Some(4));
        assert_eq!(
            samplers.stop_strings,
            Some(StopTokens::Single("\n".to_string()))
        );

        let value = serde_json::to_value(&samplers).unwrap();
        assert_eq!(value["max_tokens"], 16);
        assert_eq!(value["max_completion_tokens"], 4);
        assert_eq!(value["stop"], "\n");
    }

    #[test]
    fn test_canonical_names_are_accepted() {
        let samplers: Samplers =
            serde_json::from_str(r#"{"max_length": 8, "stop_strings": ["a", "b"]}"#).unwrap();
        assert_eq!(samplers.max_length, Some(8));
        assert_eq!(
            samplers.stop_strings,
            Some(StopTokens::Multi(vec!["a".to_string(), "b".to_string()]))
        );
    }

    #[test]
    fn test_gen_config_omits_unset_fields() {
        let samplers = Samplers {
            max_length: Some(1),
            do_sample: Some(false),
            ..Default::default()
        };
        let value = serde_json::to_value(samplers.gen_config()).unwrap();
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys.len(), 2);
        assert_eq!(value["max_length"], 1);
        assert_eq!(value["do_sample"], false);
    }

    #[test]
    fn test_resolve_prefers_request_then_defaults() {
        let config = GenerationConfig {
            temperature: Some(0.5),
            ..Default::default()
        };
        let resolved = config.resolve(&GenerationDefaults::default(), 10);
        assert_eq!(resolved.temperature, 0.5);
        assert_eq!(resolved.top_k, 50);
        assert_eq!(resolved.max_new_tokens, 2038);
        assert!(!resolved.offloaded);

        let config = GenerationConfig {
            max_length: Some(12),
            ..Default::default()
        };
        assert_eq!(
            config
                .resolve(&GenerationDefaults::default(), 10)
                .max_new_tokens,
            2
        );
    }

    #[test]
    fn test_max_new_tokens_overrides_max_length() {
        let config = GenerationConfig {
            max_length: Some(4),
            max_new_tokens: Some(7),
            ..Default::default()
        };
        let resolved = config.resolve(&GenerationDefaults::default(), 100);
        assert_eq!(resolved.max_new_tokens, 7);
    }

    #[test]
    fn test_offloaded_cache_is_resolved() {
        let config = GenerationConfig::default().with_cache_implementation(CacheImplementation::Offloaded);
        assert!(config.resolve(&GenerationDefaults::default(), 0).offloaded);
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["cache_implementation"], "offloaded");
    }

    #[test]
    fn test_greedy_sampling_when_do_sample_is_off() {
        let config = GenerationConfig {
            do_sample: Some(false),
            ..Default::default()
        };
        let resolved = config.resolve(&GenerationDefaults::default(), 0);
        assert!(matches!(resolved.sampling(), Sampling::ArgMax));

        let resolved = GenerationConfig {
            top_k: Some(0),
            ..Default::default()
        }
        .resolve(&GenerationDefaults::default(), 0);
        assert!(matches!(resolved.sampling(), Sampling::All { .. }));
    }

    #[test]
    fn test_defaults_from_generation_config_json() {
        let defaults: GenerationDefaults =
            serde_json::from_str(r#"{"temperature": 0.6, "top_p": 0.9, "bos_token_id": 1}"#)
                .unwrap();
        assert_eq!(defaults.temperature, 0.6);
        assert_eq!(defaults.top_p, 0.9);
        assert!(defaults.do_sample);
        assert_eq!(defaults.max_length, 2048);
    }

    #[test]
    fn test_null_generation_config_fields_use_defaults() {
        let defaults: GenerationDefaults = serde_json::from_str(
            r#"{"top_k": null, "temperature": null, "max_length": null, "do_sample": false}"#,
        )
        .unwrap();
        assert_eq!(defaults.top_k, 50);
        assert_eq!(defaults.temperature, 1.0);
        assert_eq!(defaults.max_length, 2048);
        assert!(!defaults.do_sample);
        assert_eq!(defaults, GenerationDefaults {
            do_sample: false,
            ..GenerationDefaults::default()
        });
    }

    #[test]
    fn test_prompt_longer_than_max_length_still_generates() {
        let config = GenerationConfig {
            max_length: Some(1),
            ..Default::default()
        };
        let defaults = GenerationDefaults::default();
        assert_eq!(config.resolve(&defaults, 5).max_new_tokens, 1);
        assert_eq!(config.resolve(&defaults, 1).max_new_tokens, 1);
        assert_eq!(config.resolve(&defaults, 0).max_new_tokens, 1);
    }
}
