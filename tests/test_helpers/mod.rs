#![allow(dead_code)]

pub mod mock_runtime;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use candle_serve::build_app;
use candle_serve::config::{CorsSettings, LogSettings, ServerSettings};
use candle_serve::engine_state::EngineHolder;
use candle_serve::openai::pipelines::llm_engine::LLMEngine;
use candle_serve::openai::OpenAIServerData;
use mock_runtime::MockRuntime;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

pub const MODEL_NAME: &str = "tiny-llama";

pub fn engine(runtime: MockRuntime) -> (Arc<MockRuntime>, Arc<LLMEngine>) {
    let runtime = Arc::new(runtime);
    let engine = Arc::new(LLMEngine::new(runtime.clone(), LogSettings::default()));
    (runtime, engine)
}

/// A holder that has loaded `runtime`.
pub fn ready_holder(runtime: MockRuntime) -> (Arc<MockRuntime>, EngineHolder) {
    let runtime = Arc::new(runtime);
    let holder = EngineHolder::new();
    let loaded = runtime.clone();
    holder
        .initialize(|| Ok(LLMEngine::new(loaded, LogSettings::default())))
        .unwrap();
    (runtime, holder)
}

pub fn app_with(holder: EngineHolder, server: ServerSettings, cors: CorsSettings) -> Router {
    let data = Arc::new(OpenAIServerData::new(holder, vec![MODEL_NAME.to_string()]));
    build_app(data, &server, &cors).unwrap()
}

pub fn app(holder: EngineHolder) -> Router {
    app_with(holder, ServerSettings::default(), CorsSettings::default())
}

pub fn ready_app(runtime: MockRuntime) -> (Arc<MockRuntime>, Router) {
    let (runtime, holder) = ready_holder(runtime);
    (runtime, app(holder))
}

pub fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub async fn send(app: Router, request: Request<Body>) -> Response<Body> {
    tokio::time::timeout(Duration::from_secs(10), app.oneshot(request))
        .await
        .expect("request timed out")
        .unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = tokio::time::timeout(
        Duration::from_secs(10),
        axum::body::to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .expect("body did not finish")
    .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

/// Payloads of the `data:` lines of an SSE body, in order.
pub fn sse_payloads(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.trim_start().to_string())
        .collect()
}

/// Parsed JSON chunks followed by the raw trailing payloads that are not JSON.
pub fn split_chunks(payloads: &[String]) -> (Vec<Value>, Vec<String>) {
    let mut chunks = Vec::new();
    let mut markers = Vec::new();
    for payload in payloads {
        match serde_json::from_str::<Value>(payload) {
            Ok(chunk) => chunks.push(chunk),
            Err(_) => markers.push(payload.clone()),
        }
    }
    (chunks, markers)
}
