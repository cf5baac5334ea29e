//! vLLM runtime adapter.
//!
//! Speaks the OpenAI `/v1/chat/completions` protocol to a vLLM server owned
//! by this process (or attached externally). The raw response object is kept
//! as the telemetry payload so the executor can probe it for speculative
//! decoding counters.

use std::{collections::VecDeque, time::Duration};

use anyhow::Context;
use futures_util::StreamExt as _;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::{
    chars_token_estimate, launcher::RuntimeProcess, GenerateOutput, GenerateRequest,
    SseLineBuffer, StreamChunk, TextStream,
};

/// Health endpoint used by the launcher when spawning a vLLM server.
pub const HEALTH_PATH: &str = "/health";

pub struct VllmAdapter {
    /// Buffered requests — has the configured request timeout.
    client: Client,
    /// Streaming requests — no request-level timeout (body arrives incrementally).
    stream_client: Client,
    base_url: String,
    model_id: String,
    version: String,
    /// Owned runtime child; `None` when attached to an external server.
    process: Mutex<Option<RuntimeProcess>>,
}

impl VllmAdapter {
    /// Build an adapter over a server at `base_url`, taking ownership of the
    /// spawned child when one is passed. Queries the server version once,
    /// best-effort.
    pub async fn connect(
        model_id: String,
        base_url: String,
        timeout_ms: u64,
        process: Option<RuntimeProcess>,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");
        let stream_client = Client::builder()
            .build()
            .expect("failed to build streaming reqwest client");

        let base_url = base_url.trim_end_matches('/').to_string();
        let version = resolve_version(&client, &base_url).await;

        Self {
            client,
            stream_client,
            base_url,
            model_id,
            version,
            process: Mutex::new(process),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub async fn generate(&self, request: GenerateRequest) -> anyhow::Result<GenerateOutput> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = wire_body(&self.model_id, &request, false);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        let status = response.status();
        let text = response.text().await.context("reading response body")?;
        if !status.is_success() {
            anyhow::bail!("vllm backend returned HTTP {status}: {text}");
        }

        let parsed: Value = serde_json::from_str(&text)
            .with_context(|| format!("parsing vllm response as JSON: {text}"))?;

        let content = parsed
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let prompt_tokens = parsed
            .pointer("/usage/prompt_tokens")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(0);
        let completion_tokens = parsed
            .pointer("/usage/completion_tokens")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or_else(|| chars_token_estimate(&content));

        Ok(GenerateOutput {
            text: content,
            prompt_tokens,
            completion_tokens,
            payload: Some(parsed),
        })
    }

    pub async fn stream(&self, request: GenerateRequest) -> anyhow::Result<TextStream> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = wire_body(&self.model_id, &request, true);

        let response = self
            .stream_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url} (streaming)"))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("vllm backend returned HTTP {status}: {text}");
        }

        struct State {
            bytes: futures_util::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
            buffer: SseLineBuffer,
            pending: VecDeque<String>,
            done: bool,
        }

        let state = State {
            bytes: response.bytes_stream().boxed(),
            buffer: SseLineBuffer::default(),
            pending: VecDeque::new(),
            done: false,
        };

        let stream = futures_util::stream::unfold(state, |mut st| async move {
            loop {
                if st.done {
                    return None;
                }
                if let Some(data) = st.pending.pop_front() {
                    if data == "[DONE]" {
                        st.done = true;
                        return None;
                    }
                    match serde_json::from_str::<Value>(&data) {
                        Ok(chunk) => {
                            let text = chunk
                                .pointer("/choices/0/delta/content")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string();
                            return Some((
                                Ok(StreamChunk {
                                    text,
                                    payload: Some(chunk),
                                }),
                                st,
                            ));
                        }
                        Err(error) => {
                            tracing::debug!(%error, "skipping unparseable SSE chunk");
                            continue;
                        }
                    }
                }
                match st.bytes.next().await {
                    Some(Ok(bytes)) => {
                        st.pending.extend(st.buffer.push(&bytes));
                    }
                    Some(Err(error)) => {
                        st.done = true;
                        return Some((Err(anyhow::Error::from(error)), st));
                    }
                    None => return None,
                }
            }
        });

        Ok(Box::pin(stream))
    }

    pub async fn health_check(&self) -> anyhow::Result<()> {
        let url = format!("{}{HEALTH_PATH}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        anyhow::ensure!(
            response.status().is_success(),
            "health check returned HTTP {}",
            response.status()
        );
        Ok(())
    }

    pub async fn close(&self) {
        if let Some(mut process) = self.process.lock().await.take() {
            process.shutdown().await;
        }
    }
}

fn wire_body(model_id: &str, request: &GenerateRequest, stream: bool) -> Value {
    let mut body = json!({
        "model": model_id,
        "messages": request.messages,
        "temperature": request.temperature,
        "max_tokens": request.max_tokens,
        "top_p": request.top_p,
        "stream": stream,
    });
    if let Some(stop) = &request.stop {
        body["stop"] = json!(stop);
    }
    if let Some(tools) = &request.tools {
        body["tools"] = tools.clone();
    }
    if let Some(format) = &request.response_format {
        body["response_format"] = format.clone();
    }
    if stream {
        body["stream_options"] = json!({ "include_usage": true });
    }
    body
}

async fn resolve_version(client: &Client, base_url: &str) -> String {
    let url = format!("{base_url}/version");
    match client.get(&url).send().await {
        Ok(response) if response.status().is_success() => response
            .json::<Value>()
            .await
            .ok()
            .and_then(|v| v.get("version").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| "unknown".into()),
        _ => "unknown".into(),
    }
}
