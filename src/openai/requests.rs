use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::responses::APIError;
use super::sampling_params::{GenerationConfig, Samplers};

/// Classification of one structured content item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    Image,
    Video,
    Other(String),
}

impl ContentKind {
    pub fn is_visual(&self) -> bool {
        matches!(self, ContentKind::Image | ContentKind::Video)
    }
}

impl From<&str> for ContentKind {
    fn from(kind: &str) -> Self {
        match kind {
            "text" => ContentKind::Text,
            "image" => ContentKind::Image,
            "video" => ContentKind::Video,
            other => ContentKind::Other(other.to_string()),
        }
    }
}

/// One typed item of a structured message, e.g. `{"type": "image", "url": ...}`.
/// Fields other than `type` are kept as received for template rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub part_type: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ContentPart {
    pub fn kind(&self) -> ContentKind {
        ContentKind::from(self.part_type.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

impl Message {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: MessageContent::Text(content.to_string()),
        }
    }

    pub fn has_visual_content(&self) -> bool {
        match &self.content {
            MessageContent::Text(_) => false,
            MessageContent::Parts(parts) => parts.iter().any(|p| p.kind().is_visual()),
        }
    }
}

/// A conversation is multimodal when any message carries an image or video item.
pub fn is_multimodal(conversation: &[Message]) -> bool {
    conversation.iter().any(Message::has_visual_content)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub samplers: Samplers,
}

impl CompletionRequest {
    pub fn validate(&self) -> Result<(), APIError> {
        if self.prompt.is_empty() {
            return Err(APIError::new_str("`prompt` must be a non-empty string"));
        }
        Ok(())
    }

    pub fn gen_config(&self) -> GenerationConfig {
        self.samplers.gen_config()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub samplers: Samplers,
}

impl ChatCompletionRequest {
    pub fn validate(&self) -> Result<(), APIError> {
        if self.messages.is_empty() {
            return Err(APIError::new_str("`messages` must contain at least one message"));
        }
        Ok(())
    }

    pub fn gen_config(&self) -> GenerationConfig {
        self.samplers.gen_config()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizeRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetokenizeRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub tokens: Vec<u32>,
}
