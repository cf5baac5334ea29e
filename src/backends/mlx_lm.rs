//! mlx-lm runtime adapter.
//!
//! The mlx-lm server speaks the OpenAI `/v1/chat/completions` protocol but
//! reports no speculative telemetry and has no version endpoint, so this
//! adapter is a lighter sibling of the vLLM one: usage only, health via
//! `/v1/models`.

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

/// Health endpoint used by the launcher when spawning an mlx-lm server.
pub const HEALTH_PATH: &str = "/v1/models";

pub struct MlxLmAdapter {
    client: Client,
    stream_client: Client,
    base_url: String,
    model_id: String,
    process: Mutex<Option<RuntimeProcess>>,
}

impl MlxLmAdapter {
    pub fn connect(
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

        Self {
            client,
            stream_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model_id,
            process: Mutex::new(process),
        }
    }

    pub fn version(&self) -> &str {
        "unknown"
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
            anyhow::bail!("mlx-lm backend returned HTTP {status}: {text}");
        }

        let parsed: Value = serde_json::from_str(&text)
            .with_context(|| format!("parsing mlx-lm response as JSON: {text}"))?;

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

        // Only the usage object is worth probing for telemetry here.
        let payload = parsed.get("usage").cloned();

        Ok(GenerateOutput {
            text: content,
            prompt_tokens,
            completion_tokens,
            payload,
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
            anyhow::bail!("mlx-lm backend returned HTTP {status}: {text}");
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
                            let payload = chunk.get("usage").cloned();
                            return Some((Ok(StreamChunk { text, payload }), st));
                        }
                        Err(error) => {
                            tracing::debug!(%error, "skipping unparseable SSE chunk");
                            continue;
                        }
                    }
                }
                match st.bytes.next().await {
                    Some(Ok(bytes)) => st.pending.extend(st.buffer.push(&bytes)),
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
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt as _;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> GenerateRequest {
        GenerateRequest {
            messages: vec![json!({"role": "user", "content": "hi"})],
            temperature: 0.0,
            max_tokens: 32,
            top_p: 1.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn generate_parses_openai_wire_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "pong" } }],
                "usage": { "prompt_tokens": 4, "completion_tokens": 1 }
            })))
            .mount(&server)
            .await;

        let adapter = MlxLmAdapter::connect("org/m".into(), server.uri(), 5_000, None);
        let output = adapter.generate(request()).await.unwrap();
        assert_eq!(output.text, "pong");
        assert_eq!(output.prompt_tokens, 4);
        // Payload carries only the usage object.
        assert_eq!(output.payload.unwrap()["completion_tokens"], 1);
    }

    #[tokio::test]
    async fn stream_preserves_backend_order() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"c\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let adapter = MlxLmAdapter::connect("org/m".into(), server.uri(), 5_000, None);
        let chunks: Vec<String> = adapter
            .stream(request())
            .await
            .unwrap()
            .filter_map(|c| async move { c.ok().map(|c| c.text) })
            .collect()
            .await;
        assert_eq!(chunks, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn health_check_probes_models_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .mount(&server)
            .await;

        let adapter = MlxLmAdapter::connect("org/m".into(), server.uri(), 5_000, None);
        assert!(adapter.health_check().await.is_ok());
    }
}
