use super::pipelines::llm_engine::{EngineError, LLMEngine};
use super::pipelines::RuntimeError;
use super::requests::{ChatCompletionRequest, CompletionRequest, DetokenizeRequest, TokenizeRequest};
use super::responses::{
    APIError, ChatCompletionResponse, CompletionResponse, DetokenizeResponse, HealthResponse,
    ModelList, Responder, TokenizeResponse, UsageInfo,
};
use super::streaming::{chat_completion_stream, completion_stream};
use super::OpenAIServerData;
use axum::{
    extract::{rejection::JsonRejection, Json, State},
    response::Sse,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

/// Routes of the OpenAI-compatible API, without any prefix or middleware.
pub fn openai_router(data: Arc<OpenAIServerData>) -> Router {
    Router::new()
        .route("/v1/completions", post(completions))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/models", get(list_models))
        .route("/v1/tokenize", post(tokenize))
        .route("/tokenize", post(tokenize))
        .route("/v1/detokenize", post(detokenize))
        .route("/detokenize", post(detokenize))
        .route("/health", get(health))
        .with_state(data)
}

fn ready_engine<T: Serialize>(data: &OpenAIServerData) -> Result<Arc<LLMEngine>, Responder<T>> {
    data.engine
        .engine()
        .map_err(|e| Responder::Unavailable(APIError::from(e)))
}

fn parse_body<B, T: Serialize>(body: Result<Json<B>, JsonRejection>) -> Result<B, Responder<T>> {
    match body {
        Ok(Json(body)) => Ok(body),
        Err(rejection) => Err(Responder::ValidationError(APIError::new(rejection.body_text()))),
    }
}

fn generation_error<T: Serialize>(e: EngineError) -> Responder<T> {
    match e {
        EngineError::Validation(msg) => Responder::ValidationError(APIError::new(msg)),
        EngineError::EngineUnavailable => Responder::Unavailable(APIError::from(e)),
        other => {
            error!("Generation failed: {other}");
            Responder::InternalError(APIError::new(format!(
                "Internal Server Error during generation. {other}"
            )))
        }
    }
}

fn task_failure(e: tokio::task::JoinError) -> EngineError {
    EngineError::GenerationFailure(RuntimeError::Model(format!("generation task failed: {e}")))
}

macro_rules! try_responder {
    ($result:expr) => {
        match $result {
            Ok(v) => v,
            Err(responder) => return responder,
        }
    };
}

pub async fn completions(
    State(data): State<Arc<OpenAIServerData>>,
    body: Result<Json<CompletionRequest>, JsonRejection>,
) -> Responder<CompletionResponse> {
    let request = try_responder!(parse_body(body));
    if let Err(e) = request.validate() {
        return Responder::ValidationError(e);
    }
    let engine = try_responder!(ready_engine(&data));
    info!(stream = request.stream, "Received completion request");

    if request.stream {
        return Responder::Streamer(Sse::new(completion_stream(engine, request)));
    }

    let config = request.gen_config();
    let model = request.model.clone();
    let prompt = request.prompt;
    let result =
        tokio::task::spawn_blocking(move || engine.generate_completion(&prompt, &config, None))
            .await;
    match result {
        Ok(Ok(generation)) => Responder::Completion(CompletionResponse::completed(
            model,
            generation.text,
            UsageInfo::new(generation.prompt_tokens, generation.completion_tokens),
        )),
        Ok(Err(e)) => generation_error(e),
        Err(e) => generation_error(task_failure(e)),
    }
}

pub async fn chat_completions(
    State(data): State<Arc<OpenAIServerData>>,
    body: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Responder<ChatCompletionResponse> {
    let request = try_responder!(parse_body(body));
    if let Err(e) = request.validate() {
        return Responder::ValidationError(e);
    }
    let engine = try_responder!(ready_engine(&data));
    info!(
        stream = request.stream,
        messages = request.messages.len(),
        "Received chat completion request"
    );

    if request.stream {
        return Responder::Streamer(Sse::new(chat_completion_stream(engine, request)));
    }

    let config = request.gen_config();
    let model = request.model.clone();
    let messages = request.messages;
    let result = tokio::task::spawn_blocking(move || {
        engine.generate_chat_completion(&messages, &config, None)
    })
    .await;
    match result {
        Ok(Ok(generation)) => Responder::Completion(ChatCompletionResponse::completed(
            model,
            generation.text,
            UsageInfo::new(generation.prompt_tokens, generation.completion_tokens),
        )),
        Ok(Err(e)) => generation_error(e),
        Err(e) => generation_error(task_failure(e)),
    }
}

pub async fn list_models(State(data): State<Arc<OpenAIServerData>>) -> Responder<ModelList> {
    let _engine = try_responder!(ready_engine(&data));
    Responder::Completion(ModelList::new(&data.served_model_names))
}

pub async fn tokenize(
    State(data): State<Arc<OpenAIServerData>>,
    body: Result<Json<TokenizeRequest>, JsonRejection>,
) -> Responder<TokenizeResponse> {
    let request = try_responder!(parse_body(body));
    let engine = try_responder!(ready_engine(&data));
    match engine.tokenize(&request.prompt) {
        Ok(tokens) => Responder::Completion(TokenizeResponse::new(tokens)),
        Err(e) => Responder::InternalError(APIError::new(format!("Internal Server Error with {e}"))),
    }
}

pub async fn detokenize(
    State(data): State<Arc<OpenAIServerData>>,
    body: Result<Json<DetokenizeRequest>, JsonRejection>,
) -> Responder<DetokenizeResponse> {
    let request = try_responder!(parse_body(body));
    let engine = try_responder!(ready_engine(&data));
    match engine.detokenize(&request.tokens) {
        Ok(prompt) => Responder::Completion(DetokenizeResponse { prompt }),
        Err(e) => Responder::InternalError(APIError::new(format!("Internal Server Error with {e}"))),
    }
}

pub async fn health(State(data): State<Arc<OpenAIServerData>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        engine_status: data.engine.status(),
    })
}
