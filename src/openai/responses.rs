use super::streaming::SseStream;
use super::utils::get_created_time_secs;
use axum::extract::Json;
use axum::http::{self, StatusCode};
use axum::response::{IntoResponse, Sse};
use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};

#[derive(Debug, Display, Error, Serialize)]
#[display(fmt = "Error: {data}")]
pub struct APIError {
    data: String,
}

impl APIError {
    pub fn new(data: String) -> Self {
        Self { data }
    }

    pub fn new_str(data: &str) -> Self {
        Self {
            data: data.to_string(),
        }
    }

    pub fn from<T: ToString>(value: T) -> Self {
        Self::new(value.to_string())
    }

    pub fn message(&self) -> &str {
        &self.data
    }
}

/// Why a generation ended. Absent (`null` on the wire) while a stream is
/// still producing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Stop,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageInfo {
    pub prompt_tokens: usize,
    pub completion_tokens: Option<usize>,
    pub total_tokens: usize,
}

impl UsageInfo {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens: Some(completion_tokens),
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

pub fn new_response_id() -> String {
    format!("cmpl-{}", uuid::Uuid::new_v4())
}

// ============================================================================
// Text completions
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub text: String,
    pub index: usize,
    pub logprobs: Option<serde_json::Value>,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub choices: Vec<CompletionChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageInfo>,
}

impl CompletionResponse {
    pub fn new(
        id: String,
        created: u64,
        model: Option<String>,
        text: String,
        finish_reason: Option<FinishReason>,
        usage: Option<UsageInfo>,
    ) -> Self {
        Self {
            id,
            object: "text_completion".to_string(),
            created,
            model,
            choices: vec![CompletionChoice {
                text,
                index: 0,
                logprobs: None,
                finish_reason,
            }],
            usage,
        }
    }

    /// A finished, non-streaming completion.
    pub fn completed(model: Option<String>, text: String, usage: UsageInfo) -> Self {
        Self::new(
            new_response_id(),
            get_created_time_secs(),
            model,
            text,
            Some(FinishReason::Stop),
            Some(usage),
        )
    }
}

// ============================================================================
// Chat completions
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl GeneratedMessage {
    pub fn assistant(content: String) -> Self {
        Self {
            role: "assistant".to_string(),
            content,
            reasoning_content: None,
        }
    }
}

/// A chat choice carries `message` when complete and `delta` while streaming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChoice {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<GeneratedMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<GeneratedMessage>,
    pub logprobs: Option<serde_json::Value>,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub choices: Vec<ChatCompletionChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageInfo>,
}

impl ChatCompletionResponse {
    fn new(
        id: String,
        created: u64,
        model: Option<String>,
        choice: ChatCompletionChoice,
        usage: Option<UsageInfo>,
    ) -> Self {
        Self {
            id,
            object: "chat_completion".to_string(),
            created,
            model,
            choices: vec![choice],
            usage,
        }
    }

    pub fn completed(model: Option<String>, content: String, usage: UsageInfo) -> Self {
        let choice = ChatCompletionChoice {
            index: 0,
            message: Some(GeneratedMessage::assistant(content)),
            delta: None,
            logprobs: None,
            finish_reason: Some(FinishReason::Stop),
        };
        Self::new(
            new_response_id(),
            get_created_time_secs(),
            model,
            choice,
            Some(usage),
        )
    }

    /// One streamed chunk. Usage is only attached to the terminal chunk.
    pub fn chunk(
        id: String,
        created: u64,
        model: Option<String>,
        content: String,
        finish_reason: Option<FinishReason>,
        usage: Option<UsageInfo>,
    ) -> Self {
        let choice = ChatCompletionChoice {
            index: 0,
            message: None,
            delta: Some(GeneratedMessage::assistant(content)),
            logprobs: None,
            finish_reason,
        };
        Self::new(id, created, model, choice, usage)
    }
}

// ============================================================================
// Models, tokenizer and health
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCard {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub owned_by: String,
}

impl ModelCard {
    pub fn new(id: String) -> Self {
        Self {
            id,
            object: "model".to_string(),
            created: get_created_time_secs(),
            owned_by: "candle-serve".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelCard>,
}

impl ModelList {
    pub fn new(names: &[String]) -> Self {
        Self {
            object: "list".to_string(),
            data: names.iter().cloned().map(ModelCard::new).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizeResponse {
    pub tokens: Vec<u32>,
    pub count: usize,
}

impl TokenizeResponse {
    pub fn new(tokens: Vec<u32>) -> Self {
        let count = tokens.len();
        Self { tokens, count }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetokenizeResponse {
    pub prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Available,
    Unavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub engine_status: EngineStatus,
}

// ============================================================================
// Error Response Handling
// ============================================================================

trait ErrorToResponse: Serialize {
    fn to_response(&self, code: StatusCode) -> axum::response::Response {
        let mut r = Json(self).into_response();
        *r.status_mut() = code;
        r
    }
}

#[derive(Serialize)]
struct JsonError {
    detail: String,
}

impl JsonError {
    fn new(detail: String) -> Self {
        Self { detail }
    }
}
impl ErrorToResponse for JsonError {}

// ============================================================================
// Responder Enum
// ============================================================================

pub enum Responder<T: Serialize> {
    Streamer(Sse<SseStream>),
    Completion(T),
    ValidationError(APIError),
    Unavailable(APIError),
    InternalError(APIError),
}

impl<T: Serialize> IntoResponse for Responder<T> {
    fn into_response(self) -> axum::response::Response {
        match self {
            Responder::Streamer(s) => s.into_response(),
            Responder::Completion(s) => Json(s).into_response(),
            Responder::ValidationError(e) => JsonError::new(e.message().to_string())
                .to_response(http::StatusCode::UNPROCESSABLE_ENTITY),
            Responder::Unavailable(e) => JsonError::new(e.message().to_string())
                .to_response(http::StatusCode::SERVICE_UNAVAILABLE),
            Responder::InternalError(e) => JsonError::new(e.message().to_string())
                .to_response(http::StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}
