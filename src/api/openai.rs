//! Client-facing OpenAI-compatible API.
//!
//! Thin handlers over [`crate::inference::InferenceEngine`]: request envelopes
//! are normalized into [`GenerateParams`], responses are wrapped back into the
//! OpenAI schema. Streaming responses are SSE with one JSON chunk per delta
//! and a final `data: [DONE]` line; multi-choice requests interleave chunks
//! with distinct `index` values.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::State,
    http::HeaderMap,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{stream, StreamExt as _};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    error::LmxError,
    inference::{ChatMessage, GenerateParams},
};

use super::AppState;

/// Build the client-facing axum router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(super::health::healthz))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/responses", post(responses))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionBody {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stop: Option<Value>,
    #[serde(default)]
    pub tools: Option<Value>,
    #[serde(default)]
    pub response_format: Option<Value>,
    #[serde(default)]
    pub frequency_penalty: Option<f64>,
    #[serde(default)]
    pub presence_penalty: Option<f64>,
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub logprobs: Option<bool>,
    #[serde(default)]
    pub top_logprobs: Option<u32>,
    #[serde(default)]
    pub num_ctx: Option<u32>,
}

impl ChatCompletionBody {
    fn into_params(self, headers: &HeaderMap) -> GenerateParams {
        let mut params = GenerateParams::new(self.model, self.messages);
        if let Some(temperature) = self.temperature {
            params.temperature = temperature;
        }
        if let Some(top_p) = self.top_p {
            params.top_p = top_p;
        }
        params.max_tokens = self.max_tokens;
        params.stop = normalize_stop(self.stop);
        params.tools = self.tools.filter(|t| !t.as_array().is_some_and(Vec::is_empty));
        params.response_format = self.response_format;
        params.num_ctx = self.num_ctx;
        params.client_id = header_string(headers, "x-client-id");
        params.priority = header_string(headers, "x-priority");
        params
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// `stop` arrives as a string or an array of strings.
fn normalize_stop(stop: Option<Value>) -> Option<Vec<String>> {
    match stop? {
        Value::String(s) => Some(vec![s]),
        Value::Array(items) => {
            let stops: Vec<String> = items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            (!stops.is_empty()).then_some(stops)
        }
        _ => None,
    }
}

fn completion_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

fn sse_json(value: &Value) -> Event {
    match Event::default().json_data(value) {
        Ok(event) => event,
        Err(_) => Event::default().data("{}"),
    }
}

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ChatCompletionBody>,
) -> Result<Response, LmxError> {
    let stream = body.stream.unwrap_or(false);
    let n = body.n.unwrap_or(1).max(1);
    let model = body.model.clone();
    let params = body.into_params(&headers);

    if stream {
        chat_completions_stream(state, params, model, n).await
    } else {
        chat_completions_buffered(state, params, model, n).await
    }
}

async fn chat_completions_buffered(
    state: Arc<AppState>,
    params: GenerateParams,
    model: String,
    n: u32,
) -> Result<Response, LmxError> {
    let mut choices = Vec::with_capacity(n as usize);
    let mut prompt_tokens = 0;
    let mut completion_tokens = 0;
    let mut queue_wait_sec: Option<f64> = None;

    for index in 0..n {
        let (result, telemetry) = state.engine.generate(params.clone()).await?;
        prompt_tokens = result.usage.prompt_tokens;
        completion_tokens += result.usage.completion_tokens;
        queue_wait_sec = queue_wait_sec.or(telemetry.queue_wait_sec);
        choices.push(json!({
            "index": index,
            "message": result.message,
            "finish_reason": result.finish_reason,
        }));
    }

    let body = json!({
        "id": completion_id("chatcmpl"),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": choices,
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        },
    });

    let mut response = Json(body).into_response();
    if let Some(wait) = queue_wait_sec {
        if let Ok(value) = axum::http::HeaderValue::from_str(&format!("{wait:.4}")) {
            response.headers_mut().insert("x-queue-wait-sec", value);
        }
    }
    Ok(response)
}

async fn chat_completions_stream(
    state: Arc<AppState>,
    params: GenerateParams,
    model: String,
    n: u32,
) -> Result<Response, LmxError> {
    let id = completion_id("chatcmpl");
    let created = chrono::Utc::now().timestamp();

    // Open every choice's stream before sending headers so slot-acquisition
    // failures still surface as proper error envelopes.
    let mut handles = Vec::with_capacity(n as usize);
    for _ in 0..n {
        handles.push(state.engine.stream_generate(params.clone()).await?);
    }

    let chunk = {
        let id = id.clone();
        let model = model.clone();
        move |index: u32, delta: Value, finish_reason: Option<&str>| {
            json!({
                "id": id,
                "object": "chat.completion.chunk",
                "created": created,
                "model": model,
                "choices": [{ "index": index, "delta": delta, "finish_reason": finish_reason }],
            })
        }
    };

    let role_chunks: Vec<Result<Event, Infallible>> = (0..n)
        .map(|index| Ok(sse_json(&chunk(index, json!({"role": "assistant"}), None))))
        .collect();

    let delta_chunk = chunk.clone();
    let merged = stream::select_all(handles.into_iter().enumerate().map(|(index, handle)| {
        handle
            .stream
            .map(move |item| (index as u32, item))
            .boxed()
    }))
    .map(move |(index, item)| match item {
        Ok(text) => Ok(sse_json(&delta_chunk(index, json!({"content": text}), None))),
        Err(error) => {
            tracing::warn!(%error, "stream error mid-flight");
            Ok(sse_json(&json!({
                "error": {
                    "message": error.to_string(),
                    "type": error.error_type(),
                    "code": error.code(),
                }
            })))
        }
    });

    let finish_chunks: Vec<Result<Event, Infallible>> = (0..n)
        .map(|index| Ok(sse_json(&chunk(index, json!({}), Some("stop")))))
        .chain(std::iter::once(Ok(Event::default().data("[DONE]"))))
        .collect();

    let sse_stream = stream::iter(role_chunks)
        .chain(merged)
        .chain(stream::iter(finish_chunks));

    Ok(Sse::new(sse_stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct CompletionBody {
    pub model: String,
    pub prompt: Value,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stop: Option<Value>,
}

/// `POST /v1/completions` — legacy text-completion envelope over the same
/// engine path.
pub async fn completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CompletionBody>,
) -> Result<Response, LmxError> {
    let prompt = match &body.prompt {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => {
            return Err(LmxError::invalid_param(
                "prompt must be a string or an array of strings",
                "prompt",
            ))
        }
    };

    let mut params = GenerateParams::new(body.model.clone(), vec![ChatMessage::user(prompt)]);
    if let Some(temperature) = body.temperature {
        params.temperature = temperature;
    }
    if let Some(top_p) = body.top_p {
        params.top_p = top_p;
    }
    params.max_tokens = body.max_tokens;
    params.stop = normalize_stop(body.stop);
    params.client_id = header_string(&headers, "x-client-id");

    let (result, _telemetry) = state.engine.generate(params).await?;

    Ok(Json(json!({
        "id": completion_id("cmpl"),
        "object": "text_completion",
        "created": chrono::Utc::now().timestamp(),
        "model": body.model,
        "choices": [{
            "index": 0,
            "text": result.message.content.unwrap_or_default(),
            "finish_reason": result.finish_reason,
            "logprobs": null,
        }],
        "usage": result.usage,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct ResponsesBody {
    pub model: String,
    pub input: Value,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
}

/// Translate a `/v1/responses` input value into chat messages. Accepts a bare
/// string or a list of `{role, content}` items whose content is a string or
/// `input_text` parts.
fn responses_input_to_messages(input: &Value) -> Result<Vec<ChatMessage>, LmxError> {
    match input {
        Value::String(text) => Ok(vec![ChatMessage::user(text.clone())]),
        Value::Array(items) => {
            let mut messages = Vec::with_capacity(items.len());
            for item in items {
                let role = item
                    .get("role")
                    .and_then(Value::as_str)
                    .unwrap_or("user")
                    .to_string();
                let content = match item.get("content") {
                    Some(Value::String(text)) => text.clone(),
                    Some(Value::Array(parts)) => parts
                        .iter()
                        .filter(|p| {
                            p.get("type").and_then(Value::as_str).unwrap_or("input_text")
                                == "input_text"
                        })
                        .filter_map(|p| p.get("text").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join(" "),
                    _ => String::new(),
                };
                messages.push(ChatMessage {
                    role,
                    content: Some(Value::String(content)),
                    name: None,
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
            Ok(messages)
        }
        _ => Err(LmxError::invalid_param(
            "input must be a string or an array of messages",
            "input",
        )),
    }
}

/// `POST /v1/responses` — same engine path; `max_output_tokens` maps to
/// `max_tokens`.
pub async fn responses(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ResponsesBody>,
) -> Result<Response, LmxError> {
    let mut messages = Vec::new();
    if let Some(instructions) = &body.instructions {
        messages.push(ChatMessage::system(instructions.clone()));
    }
    messages.extend(responses_input_to_messages(&body.input)?);

    let mut params = GenerateParams::new(body.model.clone(), messages);
    if let Some(temperature) = body.temperature {
        params.temperature = temperature;
    }
    if let Some(top_p) = body.top_p {
        params.top_p = top_p;
    }
    params.max_tokens = body.max_output_tokens;
    params.client_id = header_string(&headers, "x-client-id");

    let (result, _telemetry) = state.engine.generate(params).await?;

    Ok(Json(json!({
        "id": completion_id("resp"),
        "object": "response",
        "created_at": chrono::Utc::now().timestamp(),
        "model": body.model,
        "status": "completed",
        "output": [{
            "id": completion_id("msg"),
            "type": "message",
            "role": "assistant",
            "content": [{
                "type": "output_text",
                "text": result.message.content.unwrap_or_default(),
            }],
        }],
        "usage": {
            "input_tokens": result.usage.prompt_tokens,
            "output_tokens": result.usage.completion_tokens,
            "total_tokens": result.usage.total_tokens,
        },
    }))
    .into_response())
}

/// `GET /v1/models` — loaded models as OpenAI model objects.
pub async fn list_models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let models: Vec<Value> = state
        .engine
        .get_loaded_models()
        .into_iter()
        .map(|m| {
            json!({
                "id": m.model_id,
                "object": "model",
                "created": m.loaded_at.timestamp(),
                "owned_by": m.backend,
            })
        })
        .collect();

    Json(json!({ "object": "list", "data": models }))
}
