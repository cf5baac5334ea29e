//! Backend adapters and the unified generate/stream contract.
//!
//! [`BackendHandle`] is an enum that wraps a concrete runtime adapter chosen
//! at load time. All executor code interacts with the same small API
//! (`generate`, `stream`, `close`, `health_check`); protocol differences —
//! wire schema, endpoint paths, SSE translation — are fully encapsulated in
//! the adapter modules. A handle either *owns* a spawned runtime server child
//! process (killed on close) or is *attached* to an externally managed one
//! (close is a no-op).

pub mod gguf;
pub mod launcher;
pub mod mlx_lm;
pub mod vllm;

pub use gguf::GgufAdapter;
pub use mlx_lm::MlxLmAdapter;
pub use vllm::VllmAdapter;

use std::pin::Pin;

use futures_util::Stream;
use serde_json::Value;

use crate::config::BackendKind;

/// Unified request passed to every adapter. Messages arrive already resolved
/// into wire-ready JSON objects by the generation executor.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub messages: Vec<Value>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub stop: Option<Vec<String>>,
    pub tools: Option<Value>,
    pub response_format: Option<Value>,
}

/// Result of a non-streaming generate call.
#[derive(Debug, Clone)]
pub struct GenerateOutput {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    /// Raw response object, probed by name for speculative telemetry fields.
    pub payload: Option<Value>,
}

/// One streamed delta.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub text: String,
    /// Raw chunk object; final chunks may carry usage/telemetry fields.
    pub payload: Option<Value>,
}

/// A `Send`-able, heap-allocated stream of text deltas.
pub type TextStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

/// Unified backend handle — enum dispatch over concrete runtime adapters.
pub enum BackendHandle {
    Vllm(VllmAdapter),
    MlxLm(MlxLmAdapter),
    Gguf(GgufAdapter),
}

impl BackendHandle {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Vllm(_) => BackendKind::Vllm,
            Self::MlxLm(_) => BackendKind::MlxLm,
            Self::Gguf(_) => BackendKind::Gguf,
        }
    }

    /// Runtime server version as reported at construction, or `"unknown"`.
    pub fn version(&self) -> &str {
        match self {
            Self::Vllm(a) => a.version(),
            Self::MlxLm(a) => a.version(),
            Self::Gguf(a) => a.version(),
        }
    }

    pub async fn generate(&self, request: GenerateRequest) -> anyhow::Result<GenerateOutput> {
        match self {
            Self::Vllm(a) => a.generate(request).await,
            Self::MlxLm(a) => a.generate(request).await,
            Self::Gguf(a) => a.generate(request).await,
        }
    }

    pub async fn stream(&self, request: GenerateRequest) -> anyhow::Result<TextStream> {
        match self {
            Self::Vllm(a) => a.stream(request).await,
            Self::MlxLm(a) => a.stream(request).await,
            Self::Gguf(a) => a.stream(request).await,
        }
    }

    /// Probe the runtime server for liveness.
    pub async fn health_check(&self) -> anyhow::Result<()> {
        match self {
            Self::Vllm(a) => a.health_check().await,
            Self::MlxLm(a) => a.health_check().await,
            Self::Gguf(a) => a.health_check().await,
        }
    }

    /// Tear down the runtime. Idempotent; must not raise on double-close.
    pub async fn close(&self) {
        match self {
            Self::Vllm(a) => a.close().await,
            Self::MlxLm(a) => a.close().await,
            Self::Gguf(a) => a.close().await,
        }
    }
}

/// Character-based token estimate used when a backend reports no counts.
pub(crate) fn chars_token_estimate(text: &str) -> u32 {
    (text.chars().count() as u32).div_ceil(4)
}

/// Incremental SSE `data:` line extractor shared by the streaming adapters.
///
/// Feed raw bytes; complete `data: ...` payloads are returned in arrival
/// order. Comment lines and blank keep-alives are dropped.
#[derive(Debug, Default)]
pub(crate) struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut out = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim_start();
                if !data.is_empty() {
                    out.push(data.to_string());
                }
            }
        }
        out
    }
}
