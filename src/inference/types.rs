//! Data model for the inference engine: loaded models, request/response
//! shapes, and speculative-decoding status.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{backends::BackendHandle, config::BackendKind};

/// Speculative-decoding configuration resolved at load time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeculativeStatus {
    pub requested: bool,
    pub active: bool,
    pub reason: Option<String>,
    pub draft_model: Option<String>,
    pub num_tokens: Option<u32>,
}

/// A model resident in memory. Owned exclusively by the lifecycle manager;
/// handed out as `Arc` so the executor can serve requests without holding the
/// loaded-map lock.
pub struct LoadedModel {
    pub model_id: String,
    pub backend: BackendHandle,
    pub backend_kind: BackendKind,
    pub loaded_at: DateTime<Utc>,
    /// Unix milliseconds; atomically bumped on every request.
    last_used_at_ms: AtomicU64,
    request_count: AtomicU64,
    pub estimated_memory_gb: f64,
    pub context_length: Option<u32>,
    pub use_batching: bool,
    pub performance_overrides: Value,
    /// `None` = use the server default TTL; `Some(0)` = pinned, never evicted.
    pub keep_alive_sec: Option<u64>,
    pub speculative: SpeculativeStatus,
}

impl LoadedModel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model_id: String,
        backend: BackendHandle,
        backend_kind: BackendKind,
        estimated_memory_gb: f64,
        context_length: Option<u32>,
        use_batching: bool,
        performance_overrides: Value,
        keep_alive_sec: Option<u64>,
        speculative: SpeculativeStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            model_id,
            backend,
            backend_kind,
            loaded_at: now,
            last_used_at_ms: AtomicU64::new(now.timestamp_millis() as u64),
            request_count: AtomicU64::new(0),
            estimated_memory_gb,
            context_length,
            use_batching,
            performance_overrides,
            keep_alive_sec,
            speculative,
        }
    }

    /// Record an access: bumps `last_used_at` and the request counter.
    pub fn touch(&self) {
        self.last_used_at_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::SeqCst);
        self.request_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Refresh `last_used_at` without counting a request (load-hit path).
    pub fn refresh_last_used(&self) {
        self.last_used_at_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::SeqCst);
    }

    pub fn last_used_at_ms(&self) -> u64 {
        self.last_used_at_ms.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }

    pub fn idle_seconds(&self) -> f64 {
        let now_ms = Utc::now().timestamp_millis() as u64;
        (now_ms.saturating_sub(self.last_used_at_ms())) as f64 / 1000.0
    }
}

/// Summary returned from load and surfaced through the admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub loaded: bool,
    pub backend: String,
    pub memory_used_gb: f64,
    pub loaded_at: DateTime<Utc>,
    pub context_length: Option<u32>,
    pub request_count: u64,
    pub keep_alive_sec: Option<u64>,
    pub speculative: SpeculativeStatus,
}

impl ModelInfo {
    pub fn from_loaded(loaded: &LoadedModel) -> Self {
        Self {
            model_id: loaded.model_id.clone(),
            loaded: true,
            backend: loaded.backend_kind.as_str().to_string(),
            memory_used_gb: loaded.estimated_memory_gb,
            loaded_at: loaded.loaded_at,
            context_length: loaded.context_length,
            request_count: loaded.request_count(),
            keep_alive_sec: loaded.keep_alive_sec,
            speculative: loaded.speculative.clone(),
        }
    }
}

/// One inbound chat message. `content` may be a string, a list of multimodal
/// parts, or null; resolution to backend form happens in the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: Some(Value::String(content.into())),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: Some(Value::String(content.into())),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Parameters for one generate / stream_generate call, already normalized by
/// the HTTP layer (envelope differences, legacy field names).
#[derive(Debug, Clone)]
pub struct GenerateParams {
    pub model_id: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    pub top_p: f64,
    pub stop: Option<Vec<String>>,
    pub tools: Option<Value>,
    pub response_format: Option<Value>,
    pub num_ctx: Option<u32>,
    pub client_id: Option<String>,
    pub priority: Option<String>,
}

impl GenerateParams {
    pub fn new(model_id: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
            temperature: 0.7,
            max_tokens: None,
            top_p: 1.0,
            stop: None,
            tools: None,
            response_format: None,
            num_ctx: None,
            client_id: None,
            priority: None,
        }
    }
}

/// Assistant message in a completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub role: String,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallOut>>,
}

/// A structured tool call surfaced to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallOut {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: ToolFunctionOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFunctionOut {
    pub name: String,
    /// JSON-encoded arguments, OpenAI style.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Result of one non-streaming generation.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionResult {
    pub message: ResponseMessage,
    pub finish_reason: String,
    pub usage: Usage,
}

/// How speculative counters were obtained for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryMode {
    NotRequested,
    Disabled,
    Unavailable,
    Native,
    InferredFromFlag,
}

/// Per-request speculative decoding telemetry (§ speculative status shape).
#[derive(Debug, Clone, Serialize)]
pub struct SpeculativeTelemetry {
    pub requested: bool,
    pub active: bool,
    pub reason: Option<String>,
    pub draft_model: Option<String>,
    pub num_tokens: Option<u32>,
    pub accepted_tokens: u64,
    pub rejected_tokens: u64,
    pub ignored_tokens: u64,
    pub acceptance_ratio: Option<f64>,
    pub telemetry: TelemetryMode,
}

/// Out-of-band request results threaded back to the HTTP layer alongside the
/// response body (queue wait, speculative counters).
#[derive(Debug, Clone, Default)]
pub struct RequestTelemetry {
    pub queue_wait_sec: Option<f64>,
    pub speculative: Option<SpeculativeTelemetry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_accepts_null_and_parts_content() {
        let null: ChatMessage = serde_json::from_str(r#"{"role":"user","content":null}"#).unwrap();
        assert!(null.content.is_none() || null.content == Some(Value::Null));

        let parts: ChatMessage = serde_json::from_str(
            r#"{"role":"user","content":[{"type":"text","text":"hi"}]}"#,
        )
        .unwrap();
        assert!(parts.content.unwrap().is_array());
    }

    #[test]
    fn chat_message_preserves_tool_fields() {
        let raw = r#"{
            "role": "assistant",
            "content": null,
            "tool_calls": [{"id": "c1", "function": {"name": "f", "arguments": "{}"}}]
        }"#;
        let msg: ChatMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.tool_calls.unwrap().len(), 1);
    }

    #[test]
    fn touch_advances_last_used_and_count() {
        let model = sample_model();
        let before = model.last_used_at_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        model.touch();
        assert!(model.last_used_at_ms() >= before);
        assert_eq!(model.request_count(), 1);
    }

    #[test]
    fn last_used_never_precedes_loaded_at() {
        let model = sample_model();
        assert!(model.last_used_at_ms() >= model.loaded_at.timestamp_millis() as u64);
    }

    fn sample_model() -> LoadedModel {
        LoadedModel::new(
            "org/m".into(),
            sample_backend(),
            BackendKind::MlxLm,
            4.0,
            Some(8192),
            false,
            Value::Null,
            None,
            SpeculativeStatus::default(),
        )
    }

    fn sample_backend() -> BackendHandle {
        BackendHandle::MlxLm(crate::backends::MlxLmAdapter::connect(
            "org/m".into(),
            "http://127.0.0.1:9".into(),
            1000,
            None,
        ))
    }
}
