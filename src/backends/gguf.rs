//! GGUF runtime adapter (llama.cpp-style server).
//!
//! Translates between the unified chat contract and the native llama-server
//! protocol: chat messages are flattened into a single prompt, requests go to
//! `POST /completion`, and the streamed SSE chunks carry `content` deltas
//! with a final `stop: true` record holding token counts.
//!
//! # Protocol differences handled here
//!
//! | Concern | Unified contract | llama-server |
//! |---|---|---|
//! | Input | `messages[]` | single `prompt` string |
//! | Max tokens | `max_tokens` | `n_predict` |
//! | Prompt tokens | `usage.prompt_tokens` | `tokens_evaluated` |
//! | Completion tokens | `usage.completion_tokens` | `tokens_predicted` |

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

/// Health endpoint used by the launcher when spawning a llama-server.
pub const HEALTH_PATH: &str = "/health";

pub struct GgufAdapter {
    client: Client,
    stream_client: Client,
    base_url: String,
    version: String,
    process: Mutex<Option<RuntimeProcess>>,
}

impl GgufAdapter {
    pub async fn connect(
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
            version,
            process: Mutex::new(process),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub async fn generate(&self, request: GenerateRequest) -> anyhow::Result<GenerateOutput> {
        let url = format!("{}/completion", self.base_url);
        let body = native_body(&request, false);

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
            anyhow::bail!("gguf backend returned HTTP {status}: {text}");
        }

        let parsed: Value = serde_json::from_str(&text)
            .with_context(|| format!("parsing gguf response as JSON: {text}"))?;

        let content = parsed
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let prompt_tokens = parsed
            .get("tokens_evaluated")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(0);
        let completion_tokens = parsed
            .get("tokens_predicted")
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
        let url = format!("{}/completion", self.base_url);
        let body = native_body(&request, true);

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
            anyhow::bail!("gguf backend returned HTTP {status}: {text}");
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
                    match serde_json::from_str::<Value>(&data) {
                        Ok(chunk) => {
                            let text = chunk
                                .get("content")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string();
                            // The final record carries `stop: true` plus counts.
                            if chunk.get("stop").and_then(Value::as_bool) == Some(true) {
                                st.done = true;
                            }
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

/// Flatten chat messages into a single prompt the completion endpoint accepts.
///
/// Tool and response-format hints are not expressible on this wire; the
/// executor is responsible for folding them into the message text first.
fn flatten_prompt(messages: &[Value]) -> String {
    let mut prompt = String::new();
    for message in messages {
        let role = message
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or("user");
        let content = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        prompt.push_str(role);
        prompt.push_str(": ");
        prompt.push_str(content);
        prompt.push('\n');
    }
    prompt.push_str("assistant: ");
    prompt
}

fn native_body(request: &GenerateRequest, stream: bool) -> Value {
    let mut body = json!({
        "prompt": flatten_prompt(&request.messages),
        "n_predict": request.max_tokens,
        "temperature": request.temperature,
        "top_p": request.top_p,
        "stream": stream,
    });
    if let Some(stop) = &request.stop {
        body["stop"] = json!(stop);
    }
    body
}

async fn resolve_version(client: &Client, base_url: &str) -> String {
    let url = format!("{base_url}/props");
    match client.get(&url).send().await {
        Ok(response) if response.status().is_success() => response
            .json::<Value>()
            .await
            .ok()
            .and_then(|v| {
                v.pointer("/build_info")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "unknown".into()),
        _ => "unknown".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt as _;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> GenerateRequest {
        GenerateRequest {
            messages: vec![
                json!({"role": "system", "content": "Be terse."}),
                json!({"role": "user", "content": "hi"}),
            ],
            temperature: 0.2,
            max_tokens: 16,
            top_p: 0.9,
            ..Default::default()
        }
    }

    #[test]
    fn prompt_flattens_roles_in_order() {
        let prompt = flatten_prompt(&request().messages);
        assert_eq!(prompt, "system: Be terse.\nuser: hi\nassistant: ");
    }

    #[test]
    fn native_body_maps_max_tokens_to_n_predict() {
        let body = native_body(&request(), false);
        assert_eq!(body["n_predict"], 16);
        assert_eq!(body["stream"], false);
        assert!(body.get("stop").is_none());
    }

    #[tokio::test]
    async fn generate_translates_native_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/completion"))
            .and(body_partial_json(json!({"n_predict": 16})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": "hello",
                "tokens_evaluated": 9,
                "tokens_predicted": 2
            })))
            .mount(&server)
            .await;

        let adapter = GgufAdapter::connect(server.uri(), 5_000, None).await;
        let output = adapter.generate(request()).await.unwrap();
        assert_eq!(output.text, "hello");
        assert_eq!(output.prompt_tokens, 9);
        assert_eq!(output.completion_tokens, 2);
    }

    #[tokio::test]
    async fn stream_terminates_on_stop_record() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"content\":\"he\",\"stop\":false}\n\n",
            "data: {\"content\":\"y\",\"stop\":true,\"tokens_predicted\":2}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/completion"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let adapter = GgufAdapter::connect(server.uri(), 5_000, None).await;
        let chunks: Vec<StreamChunk> = adapter
            .stream(request())
            .await
            .unwrap()
            .filter_map(|c| async move { c.ok() })
            .collect()
            .await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "he");
        assert_eq!(chunks[1].text, "y");
        assert_eq!(
            chunks[1].payload.as_ref().unwrap()["tokens_predicted"],
            2
        );
    }
}
