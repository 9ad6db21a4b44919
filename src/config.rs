use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Used when the requested settings file does not exist.
pub const SAMPLE_CONFIG_PATH: &str = "config/config.yaml.sample";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Configuration error: 'model.model_path' is required.")]
    MissingModelPath,
}

/// A single name or a list of names.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => vec![],
        Some(OneOrMany::One(name)) => vec![name],
        Some(OneOrMany::Many(names)) => names,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Prefix under which every route is mounted, e.g. `/api`.
    #[serde(default)]
    pub root_path: String,
    #[serde(default, deserialize_with = "one_or_many")]
    pub served_model_names: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            root_path: String::new(),
            served_model_names: vec![],
        }
    }
}

/// Log level plus switches for logging request and response bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub prompt: bool,
    #[serde(default)]
    pub params: bool,
    #[serde(default)]
    pub completion: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            prompt: false,
            params: false,
            completion: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Local model directory or Hugging Face model id.
    pub model_path: String,
    /// `auto`, `cpu`, `cuda`, `cuda:<ordinal>` or `metal`
    #[serde(default = "default_device")]
    pub device: String,
    /// `bfloat16`, `float16`, `float32` or `auto`
    #[serde(default = "default_precision")]
    pub precision: String,
    #[serde(default)]
    pub revision: Option<String>,
    /// Name of an environment variable holding a Hugging Face token.
    #[serde(default)]
    pub hf_token: Option<String>,
    /// File holding a Hugging Face token.
    #[serde(default)]
    pub hf_token_path: Option<String>,
}

fn default_device() -> String {
    "auto".to_string()
}

fn default_precision() -> String {
    "bfloat16".to_string()
}

impl ModelSettings {
    /// Last path segment of `model_path`.
    pub fn model_name(&self) -> String {
        self.model_path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "wildcard")]
    pub allow_origins: Vec<String>,
    #[serde(default = "default_true")]
    pub allow_credentials: bool,
    #[serde(default = "wildcard")]
    pub allow_methods: Vec<String>,
    #[serde(default = "wildcard")]
    pub allow_headers: Vec<String>,
}

fn wildcard() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_true() -> bool {
    true
}

impl Default for CorsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_origins: wildcard(),
            allow_credentials: true,
            allow_methods: wildcard(),
            allow_headers: wildcard(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub server: ServerSettings,
    pub model: ModelSettings,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub cors: CorsSettings,
}

impl AppSettings {
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let value: serde_yaml::Value = serde_yaml::from_str(content)?;
        let has_model_path = value
            .get("model")
            .and_then(|model| model.get("model_path"))
            .is_some_and(|path| !path.is_null());
        if !has_model_path {
            return Err(ConfigError::MissingModelPath);
        }
        let mut settings: AppSettings = serde_yaml::from_value(value)?;
        settings.normalize();
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// The model directory name is always served.
    fn normalize(&mut self) {
        let name = self.model.model_name();
        if !name.is_empty() && !self.server.served_model_names.contains(&name) {
            self.server.served_model_names.push(name);
        }
    }

    /// Re-apply the invariants after command-line overrides.
    pub fn with_model_path(mut self, model_path: String) -> Self {
        self.model.model_path = model_path;
        self.normalize();
        self
    }
}

/// `path` if it exists, else the bundled sample. The flag reports the fallback.
pub fn resolve_config_path(path: &Path) -> (PathBuf, bool) {
    if path.exists() {
        (path.to_path_buf(), false)
    } else {
        (PathBuf::from(SAMPLE_CONFIG_PATH), true)
    }
}
