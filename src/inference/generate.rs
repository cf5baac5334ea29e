//! The request execution path: generate and stream_generate.
//!
//! Both paths share a preamble — routability check, context fitting, message
//! resolution — then run the backend call under the concurrency controller's
//! slots with a hard timeout. Failures feed the readiness tracker's crash
//! counter; repeated failures quarantine the model and routing refuses it.
//!
//! Per-request results that don't fit the response body (queue wait,
//! speculative telemetry) are returned as [`RequestTelemetry`] for the HTTP
//! layer to surface in headers or logs.

use std::{
    pin::Pin,
    sync::{Arc, OnceLock},
    time::Duration,
};

use futures_util::{Stream, StreamExt as _};
use serde_json::{json, Value};

use crate::{
    backends::GenerateRequest,
    concurrency::{ConcurrencyController, Priority, SlotGuard},
    error::LmxError,
    memory::MemoryMonitor,
    registry::{ReadinessState, ReadinessTracker},
};

use super::{
    lifecycle::LoadedModels,
    speculative::TelemetryAccumulator,
    tool_calls::{self, TOOL_CALL_OPEN},
    types::{
        ChatMessage, CompletionResult, GenerateParams, LoadedModel, RequestTelemetry,
        ResponseMessage, Usage,
    },
};

/// Output-token reserve applied during context fitting when the request has
/// no `max_tokens`.
const DEFAULT_OUTPUT_RESERVE: u32 = 1024;

/// Per-message token overhead for role/formatting scaffolding.
const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// A stream of text deltas in backend order.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, LmxError>> + Send>>;

/// A live token stream plus the request's queue-wait bookkeeping.
pub struct StreamHandle {
    pub stream: DeltaStream,
    pub queue_wait_sec: f64,
}

pub struct GenerationExecutor {
    models: Arc<LoadedModels>,
    readiness: Arc<ReadinessTracker>,
    concurrency: Arc<ConcurrencyController>,
    memory: Arc<MemoryMonitor>,
    inference_timeout: Duration,
    quarantine_threshold: u32,
}

impl GenerationExecutor {
    pub fn new(
        models: Arc<LoadedModels>,
        readiness: Arc<ReadinessTracker>,
        concurrency: Arc<ConcurrencyController>,
        memory: Arc<MemoryMonitor>,
        inference_timeout: Duration,
        quarantine_threshold: u32,
    ) -> Self {
        Self {
            models,
            readiness,
            concurrency,
            memory,
            inference_timeout,
            quarantine_threshold,
        }
    }

    /// Non-streaming completion.
    pub async fn generate(
        &self,
        params: GenerateParams,
    ) -> Result<(CompletionResult, RequestTelemetry), LmxError> {
        let loaded = self.fetch_routable(&params.model_id)?;
        loaded.touch();

        let request = self.build_backend_request(&loaded, &params);
        let guard = self
            .concurrency
            .acquire(
                &params.model_id,
                Priority::parse(params.priority.as_deref()),
                params.client_id.as_deref(),
            )
            .await?;
        let queue_wait_sec = guard.queue_wait_sec;

        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(self.inference_timeout, loaded.backend.generate(request))
            .await;
        let elapsed = started.elapsed().as_secs_f64();
        self.concurrency.record_latency_sample(elapsed);

        let output = match outcome {
            Err(_) => {
                drop(guard);
                self.concurrency.adapt(&self.memory);
                return Err(LmxError::InferenceTimedOut {
                    model_id: params.model_id.clone(),
                    timeout_sec: self.inference_timeout.as_secs(),
                });
            }
            Ok(Err(error)) => {
                drop(guard);
                return Err(self.record_inference_failure(&params.model_id, error));
            }
            Ok(Ok(output)) => output,
        };
        drop(guard);

        let mut accumulator = TelemetryAccumulator::new(&loaded.speculative);
        accumulator.update_from_payload(output.payload.as_ref());
        let speculative = accumulator.finalize(output.completion_tokens as u64);

        self.concurrency.adapt(&self.memory);

        let result = postprocess(
            &output.text,
            output.prompt_tokens,
            output.completion_tokens,
            params.max_tokens,
            params.tools.as_ref(),
            params.response_format.as_ref(),
        );

        tracing::debug!(
            model_id = params.model_id,
            latency_sec = elapsed,
            finish_reason = result.finish_reason,
            "generate_complete"
        );

        Ok((
            result,
            RequestTelemetry {
                queue_wait_sec: Some(queue_wait_sec),
                speculative: Some(speculative),
            },
        ))
    }

    /// Streaming completion. Token order is the backend's; cancellation by
    /// the consumer releases slots without leaking.
    pub async fn stream_generate(&self, params: GenerateParams) -> Result<StreamHandle, LmxError> {
        let loaded = self.fetch_routable(&params.model_id)?;
        loaded.touch();

        let request = self.build_backend_request(&loaded, &params);
        let guard = self
            .concurrency
            .acquire(
                &params.model_id,
                Priority::parse(params.priority.as_deref()),
                params.client_id.as_deref(),
            )
            .await?;
        let queue_wait_sec = guard.queue_wait_sec;

        let started = std::time::Instant::now();
        let inner = match tokio::time::timeout(self.inference_timeout, loaded.backend.stream(request))
            .await
        {
            Err(_) => {
                return Err(LmxError::InferenceTimedOut {
                    model_id: params.model_id.clone(),
                    timeout_sec: self.inference_timeout.as_secs(),
                })
            }
            Ok(Err(error)) => {
                return Err(self.record_inference_failure(&params.model_id, error));
            }
            Ok(Ok(stream)) => stream,
        };

        let state = StreamState {
            inner,
            _guard: guard,
            accumulator: TelemetryAccumulator::new(&loaded.speculative),
            chunk_count: 0,
            model_id: params.model_id.clone(),
            readiness: Arc::clone(&self.readiness),
            concurrency: Arc::clone(&self.concurrency),
            memory: Arc::clone(&self.memory),
            quarantine_threshold: self.quarantine_threshold,
            started,
            timeout: self.inference_timeout,
            finished: false,
        };

        let stream = futures_util::stream::unfold(state, |mut st| async move {
            if st.finished {
                return None;
            }
            loop {
                match tokio::time::timeout(st.timeout, st.inner.next()).await {
                    Err(_) => {
                        st.finished = true;
                        st.finalize();
                        let err = LmxError::InferenceTimedOut {
                            model_id: st.model_id.clone(),
                            timeout_sec: st.timeout.as_secs(),
                        };
                        return Some((Err(err), st));
                    }
                    Ok(None) => {
                        st.finished = true;
                        st.finalize();
                        return None;
                    }
                    Ok(Some(Err(error))) => {
                        st.finished = true;
                        st.finalize();
                        let record = st.readiness.mark_failure(
                            &st.model_id,
                            &error.to_string(),
                            st.quarantine_threshold,
                        );
                        if record.state == ReadinessState::Quarantined {
                            tracing::warn!(
                                model_id = st.model_id,
                                crash_count = record.crash_count,
                                "model_quarantined_after_stream_failure"
                            );
                        }
                        return Some((Err(LmxError::Internal(error)), st));
                    }
                    Ok(Some(Ok(chunk))) => {
                        st.accumulator.update_from_payload(chunk.payload.as_ref());
                        if chunk.text.is_empty() {
                            continue;
                        }
                        st.chunk_count += 1;
                        return Some((Ok(chunk.text), st));
                    }
                }
            }
        });

        Ok(StreamHandle {
            stream: Box::pin(stream),
            queue_wait_sec,
        })
    }

    // ── Shared preamble ─────────────────────────────────────────────────

    /// Routability gate: quarantined refuses regardless of map presence;
    /// absent models are not-found; anything short of `routable` refuses.
    fn fetch_routable(&self, model_id: &str) -> Result<Arc<LoadedModel>, LmxError> {
        let readiness = self.readiness.get(model_id);
        if let Some(record) = &readiness {
            if record.state == ReadinessState::Quarantined {
                return Err(LmxError::ModelUnstable {
                    model_id: model_id.to_string(),
                    reason: record
                        .reason
                        .clone()
                        .or_else(|| record.last_failure_reason.clone())
                        .unwrap_or_else(|| "quarantined".into()),
                });
            }
        }
        let Some(loaded) = self.models.get(model_id) else {
            return Err(LmxError::ModelNotFound {
                model_id: model_id.to_string(),
            });
        };
        match readiness.map(|r| r.state) {
            Some(ReadinessState::Routable) => Ok(loaded),
            other => Err(LmxError::ModelUnstable {
                model_id: model_id.to_string(),
                reason: format!(
                    "model is not routable (state: {})",
                    other.map(|s| s.as_str().to_string()).unwrap_or_else(|| "unknown".into())
                ),
            }),
        }
    }

    fn build_backend_request(
        &self,
        loaded: &LoadedModel,
        params: &GenerateParams,
    ) -> GenerateRequest {
        let mut messages = params.messages.clone();

        if let Some(limit) = params.num_ctx.or(loaded.context_length) {
            let reserve = params.max_tokens.unwrap_or(DEFAULT_OUTPUT_RESERVE);
            fit_messages(&mut messages, limit, reserve);
        }

        let mut resolved = resolve_messages(&messages);

        // Structured output without tools gets an explicit JSON instruction.
        if params.response_format.is_some() && params.tools.is_none() {
            resolved.push(json!({
                "role": "system",
                "content": "Respond with a single valid JSON value matching the requested \
                            format. Output JSON only, with no surrounding prose.",
            }));
        }

        GenerateRequest {
            messages: resolved,
            temperature: params.temperature,
            max_tokens: params.max_tokens.unwrap_or(DEFAULT_OUTPUT_RESERVE),
            top_p: params.top_p,
            stop: params.stop.clone(),
            tools: params.tools.clone(),
            response_format: params.response_format.clone(),
        }
    }

    fn record_inference_failure(&self, model_id: &str, error: anyhow::Error) -> LmxError {
        let record =
            self.readiness
                .mark_failure(model_id, &error.to_string(), self.quarantine_threshold);
        if record.state == ReadinessState::Quarantined {
            tracing::warn!(
                model_id,
                crash_count = record.crash_count,
                "model_quarantined_after_inference_failure"
            );
            LmxError::Internal(error.context(format!(
                "inference failed on '{model_id}'; model quarantined after \
                 {} consecutive failures",
                record.crash_count
            )))
        } else {
            LmxError::Internal(error)
        }
    }
}

/// Stream wrapper state. Dropping it before completion (consumer cancelled)
/// releases the slot guard and logs the teardown — cancellation is
/// cooperative, not an error.
struct StreamState {
    inner: crate::backends::TextStream,
    _guard: SlotGuard,
    accumulator: TelemetryAccumulator,
    chunk_count: u64,
    model_id: String,
    readiness: Arc<ReadinessTracker>,
    concurrency: Arc<ConcurrencyController>,
    memory: Arc<MemoryMonitor>,
    quarantine_threshold: u32,
    started: std::time::Instant,
    timeout: Duration,
    finished: bool,
}

impl StreamState {
    fn finalize(&mut self) {
        let elapsed = self.started.elapsed().as_secs_f64();
        self.concurrency.record_latency_sample(elapsed);
        self.concurrency.adapt(&self.memory);
        let telemetry = self.accumulator.clone().finalize(self.chunk_count);
        tracing::debug!(
            model_id = self.model_id,
            latency_sec = elapsed,
            chunks = self.chunk_count,
            telemetry = ?telemetry.telemetry,
            "stream_complete"
        );
    }
}

impl Drop for StreamState {
    fn drop(&mut self) {
        if !self.finished {
            tracing::info!(
                model_id = self.model_id,
                chunks = self.chunk_count,
                "stream_cancelled"
            );
            let elapsed = self.started.elapsed().as_secs_f64();
            self.concurrency.record_latency_sample(elapsed);
        }
    }
}

// ── Message resolution & context fitting ────────────────────────────────

/// Convert inbound messages to backend dicts (§ message resolution rules):
/// null content becomes an empty string, multimodal parts pass through, and
/// string-encoded tool-call arguments are re-parsed to object form.
pub fn resolve_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| {
            let content = match &message.content {
                None | Some(Value::Null) => Value::String(String::new()),
                Some(other) => other.clone(),
            };
            let mut resolved = json!({ "role": message.role, "content": content });

            if let Some(name) = &message.name {
                resolved["name"] = json!(name);
            }
            if let Some(tool_call_id) = &message.tool_call_id {
                resolved["tool_call_id"] = json!(tool_call_id);
            }
            if let Some(tool_calls) = &message.tool_calls {
                let reparsed: Vec<Value> = tool_calls
                    .iter()
                    .map(|call| {
                        let mut call = call.clone();
                        if let Some(arguments) = call.pointer("/function/arguments") {
                            if let Some(raw) = arguments.as_str() {
                                // Template engines want object-form arguments.
                                if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
                                    call["function"]["arguments"] = parsed;
                                }
                            }
                        }
                        call
                    })
                    .collect();
                resolved["tool_calls"] = Value::Array(reparsed);
            }

            resolved
        })
        .collect()
}

/// Trim oldest non-system messages until the estimated prompt plus the
/// output reserve fits the context limit. The final message always survives.
pub fn fit_messages(messages: &mut Vec<ChatMessage>, limit: u32, reserve_for_output: u32) {
    let budget = limit.saturating_sub(reserve_for_output);
    let mut dropped = 0usize;

    while estimate_prompt_tokens(messages) > budget {
        let Some(index) = messages
            .iter()
            .enumerate()
            .take(messages.len().saturating_sub(1))
            .find(|(_, m)| m.role != "system")
            .map(|(i, _)| i)
        else {
            break;
        };
        messages.remove(index);
        dropped += 1;
    }

    if dropped > 0 {
        tracing::debug!(dropped, limit, "context_fitting_trimmed_messages");
    }
}

/// Token estimate for the whole prompt: tokenizer when available, chars/4
/// otherwise, plus a fixed per-message overhead.
pub fn estimate_prompt_tokens(messages: &[ChatMessage]) -> u32 {
    messages
        .iter()
        .map(|m| estimate_text_tokens(&message_text(m)) + MESSAGE_OVERHEAD_TOKENS)
        .sum()
}

fn message_text(message: &ChatMessage) -> String {
    match &message.content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

fn estimate_text_tokens(text: &str) -> u32 {
    static BPE: OnceLock<Option<tiktoken_rs::CoreBPE>> = OnceLock::new();
    let bpe = BPE.get_or_init(|| tiktoken_rs::cl100k_base().ok());
    match bpe {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u32,
        None => crate::backends::chars_token_estimate(text),
    }
}

// ── Post-processing ─────────────────────────────────────────────────────

/// Build the final message + finish reason from the raw completion text.
///
/// Finish-reason precedence: `tool_calls` > `length` > `stop`.
fn postprocess(
    text: &str,
    prompt_tokens: u32,
    completion_tokens: u32,
    max_tokens: Option<u32>,
    tools: Option<&Value>,
    response_format: Option<&Value>,
) -> CompletionResult {
    let usage = Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    };
    let hit_length_cap = max_tokens.is_some_and(|cap| completion_tokens >= cap);

    if tools.is_some() && text.contains(TOOL_CALL_OPEN) {
        let parsed = tool_calls::parse_tool_calls(text, tools);
        if parsed.has_calls() {
            return CompletionResult {
                message: ResponseMessage {
                    role: "assistant".into(),
                    content: (!parsed.content.is_empty()).then_some(parsed.content),
                    tool_calls: Some(parsed.calls),
                },
                finish_reason: "tool_calls".into(),
                usage,
            };
        }
    }

    let content = if response_format.is_some() && tools.is_none() {
        match tool_calls::extract_json(text) {
            Some(value) => {
                serde_json::to_string(&value).unwrap_or_else(|_| text.to_string())
            }
            None => {
                tracing::warn!("structured output requested but no JSON found in completion");
                text.to_string()
            }
        }
    } else {
        text.to_string()
    };

    CompletionResult {
        message: ResponseMessage {
            role: "assistant".into(),
            content: Some(content),
            tool_calls: None,
        },
        finish_reason: if hit_length_cap { "length" } else { "stop" }.into(),
        usage,
    }
}
