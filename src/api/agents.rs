//! Agent runs API: submission, inspection, cancellation, and an SSE event
//! feed per run.

use std::{collections::VecDeque, convert::Infallible, sync::Arc, time::Duration};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::{
    agents::{AgentRequest, AgentRun},
    error::LmxError,
    events::ServerEvent,
};

use super::AppState;

/// Comment heartbeat cadence on the run event feed.
const HEARTBEAT: Duration = Duration::from_secs(10);

/// Build the agents sub-router (mounted on the client listener).
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/agents/runs", post(create_run).get(list_runs))
        .route("/v1/agents/runs/{run_id}", get(get_run))
        .route("/v1/agents/runs/{run_id}/cancel", post(cancel_run))
        .route("/v1/agents/runs/{run_id}/events", get(run_events))
        .with_state(state)
}

fn run_json(run: &AgentRun) -> Value {
    serde_json::to_value(run).unwrap_or(Value::Null)
}

/// POST /v1/agents/runs — submit a run; `Idempotency-Key` dedupes retries.
pub async fn create_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut request): Json<AgentRequest>,
) -> Result<Response, LmxError> {
    if request.submitted_by.is_none() {
        request.submitted_by = headers
            .get("x-client-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
    }
    if let Some(traceparent) = &request.traceparent {
        if !is_valid_traceparent(traceparent) {
            return Err(LmxError::invalid_param(
                "traceparent must match the W3C trace-context format",
                "traceparent",
            ));
        }
    }

    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());

    let run = state.agents.submit(request, idempotency_key)?;

    // Saturation is reported as a failed run by the scheduler; the HTTP
    // surface turns that into a 429 with Retry-After.
    if run
        .error
        .as_deref()
        .is_some_and(|e| e.contains("queue is full"))
    {
        return Err(LmxError::QueueSaturated);
    }

    Ok((StatusCode::CREATED, Json(run_json(&run))).into_response())
}

/// W3C trace-context: `00-<32 hex>-<16 hex>-<2 hex>`.
fn is_valid_traceparent(value: &str) -> bool {
    let parts: Vec<&str> = value.split('-').collect();
    parts.len() == 4
        && parts[0].len() == 2
        && parts[1].len() == 32
        && parts[2].len() == 16
        && parts[3].len() == 2
        && parts
            .iter()
            .all(|p| p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// GET /v1/agents/runs
pub async fn list_runs(State(state): State<Arc<AppState>>) -> Json<Value> {
    let runs: Vec<Value> = state.agents.list(100).iter().map(run_json).collect();
    Json(json!({ "runs": runs }))
}

/// GET /v1/agents/runs/{run_id}
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, LmxError> {
    let run = state
        .agents
        .get(&run_id)
        .ok_or(LmxError::RunNotFound { run_id })?;
    Ok(Json(run_json(&run)))
}

/// POST /v1/agents/runs/{run_id}/cancel
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, LmxError> {
    let run = state.agents.cancel(&run_id)?;
    Ok(Json(run_json(&run)))
}

/// GET /v1/agents/runs/{run_id}/events — SSE feed of `run.update` and
/// `run.completed` events with a heartbeat comment every ten seconds and a
/// final `data: [DONE]` line.
pub async fn run_events(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Response, LmxError> {
    let run = state
        .agents
        .get(&run_id)
        .ok_or_else(|| LmxError::RunNotFound {
            run_id: run_id.clone(),
        })?;

    struct FeedState {
        rx: broadcast::Receiver<ServerEvent>,
        heartbeat: tokio::time::Interval,
        run_id: String,
        queue: VecDeque<Event>,
        finished: bool,
    }

    let mut queue = VecDeque::new();
    queue.push_back(named_event("run.update", &run_json(&run)));
    let finished = run.status.is_terminal();
    if finished {
        queue.push_back(named_event("run.completed", &run_json(&run)));
        queue.push_back(Event::default().data("[DONE]"));
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick is immediate; the snapshot already serves that purpose.
    heartbeat.reset();

    let feed = FeedState {
        rx: state.agents.subscribe(),
        heartbeat,
        run_id,
        queue,
        finished,
    };

    let stream = futures_util::stream::unfold(feed, |mut feed| async move {
        loop {
            if let Some(event) = feed.queue.pop_front() {
                return Some((Ok::<Event, Infallible>(event), feed));
            }
            if feed.finished {
                return None;
            }
            tokio::select! {
                received = feed.rx.recv() => match received {
                    Ok(event) => {
                        if event.data.get("id").and_then(Value::as_str)
                            != Some(feed.run_id.as_str())
                        {
                            continue;
                        }
                        match event.event_type.as_str() {
                            "run.update" => {
                                feed.queue.push_back(named_event("run.update", &event.data));
                            }
                            "run.completed" => {
                                feed.queue
                                    .push_back(named_event("run.completed", &event.data));
                                feed.queue.push_back(Event::default().data("[DONE]"));
                                feed.finished = true;
                            }
                            _ => continue,
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "run event feed lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                _ = feed.heartbeat.tick() => {
                    return Some((Ok(Event::default().comment("heartbeat")), feed));
                }
            }
        }
    });

    Ok(Sse::new(stream).into_response())
}

fn named_event(name: &str, data: &Value) -> Event {
    let event = Event::default().event(name);
    match event.json_data(data) {
        Ok(event) => event,
        Err(_) => Event::default().event(name.to_string()).data("{}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        agents::{AgentRuntime, RunStore},
        config::Config,
        download::{DownloadCoordinator, Fetcher, ProgressFn},
        events::EventBus,
        inference::InferenceEngine,
        memory::MemoryMonitor,
        registry::{AutotuneRegistry, CompatibilityRegistry},
    };
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use tokio_util::sync::CancellationToken;

    struct NoopFetcher;

    #[async_trait]
    impl Fetcher for NoopFetcher {
        async fn fetch(
            &self,
            _repo_id: &str,
            _revision: Option<&str>,
            _dest: &std::path::Path,
            _progress: ProgressFn,
            _cancel: CancellationToken,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// No models are loaded, so every step fails with "No routable model" —
    /// enough to exercise the HTTP surface end to end.
    async fn app_state() -> Arc<AppState> {
        let config = Arc::new(Config::default());
        let bus = EventBus::new(64);
        #[allow(deprecated)]
        let state_dir = tempfile::tempdir().unwrap().into_path();

        let engine = Arc::new(InferenceEngine::assemble(
            &config,
            state_dir.clone(),
            bus.clone(),
            Arc::new(MemoryMonitor::fixed(90.0, 128.0, 51.2)),
            Arc::new(CompatibilityRegistry::new(64)),
            Arc::new(AutotuneRegistry::new()),
        ));
        let agents = AgentRuntime::start(
            Arc::clone(&engine) as Arc<dyn crate::agents::RunEngine>,
            config.agents.clone(),
            RunStore::memory(),
            bus.clone(),
        );
        let downloads = Arc::new(DownloadCoordinator::new(
            state_dir.join("models"),
            5.0,
            Arc::new(NoopFetcher),
        ));
        AppState::new(engine, agents, downloads, config)
    }

    async fn spawn_app(state: Arc<AppState>) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        addr
    }

    fn run_body() -> Value {
        json!({
            "strategy": "handoff",
            "prompt": "review this",
            "roles": ["critic"],
        })
    }

    #[test]
    fn traceparent_validation() {
        assert!(is_valid_traceparent(
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"
        ));
        assert!(!is_valid_traceparent("not-a-traceparent"));
        assert!(!is_valid_traceparent(
            "00-zzzz651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"
        ));
    }

    #[tokio::test]
    async fn submit_creates_and_fetches_a_run() {
        let state = app_state().await;
        let addr = spawn_app(state).await;
        let client = reqwest::Client::new();

        let created = client
            .post(format!("http://{addr}/v1/agents/runs"))
            .json(&run_body())
            .send()
            .await
            .unwrap();
        assert_eq!(created.status(), 201);
        let run: Value = created.json().await.unwrap();
        let run_id = run["id"].as_str().unwrap();

        let fetched: Value = client
            .get(format!("http://{addr}/v1/agents/runs/{run_id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(fetched["id"], run["id"]);
        assert_eq!(fetched["request"]["prompt"], "review this");
    }

    #[tokio::test]
    async fn unknown_run_is_404() {
        let state = app_state().await;
        let addr = spawn_app(state).await;
        let response = reqwest::get(format!("http://{addr}/v1/agents/runs/ghost"))
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn idempotency_conflict_is_409() {
        let state = app_state().await;
        let addr = spawn_app(state).await;
        let client = reqwest::Client::new();

        let first = client
            .post(format!("http://{addr}/v1/agents/runs"))
            .header("idempotency-key", "k1")
            .json(&run_body())
            .send()
            .await
            .unwrap();
        assert_eq!(first.status(), 201);
        let first_run: Value = first.json().await.unwrap();

        // Identical resubmission returns the same run.
        let replay = client
            .post(format!("http://{addr}/v1/agents/runs"))
            .header("idempotency-key", "k1")
            .json(&run_body())
            .send()
            .await
            .unwrap();
        let replay_run: Value = replay.json().await.unwrap();
        assert_eq!(replay_run["id"], first_run["id"]);

        // Same key, different payload: conflict, no new run.
        let mut different = run_body();
        different["prompt"] = json!("something else");
        let conflict = client
            .post(format!("http://{addr}/v1/agents/runs"))
            .header("idempotency-key", "k1")
            .json(&different)
            .send()
            .await
            .unwrap();
        assert_eq!(conflict.status(), 409);
        let body: Value = conflict.json().await.unwrap();
        assert_eq!(body["error"]["code"], "idempotency_conflict");
    }

    #[tokio::test]
    async fn invalid_traceparent_is_400() {
        let state = app_state().await;
        let addr = spawn_app(state).await;

        let mut body = run_body();
        body["traceparent"] = json!("garbage");
        let response = reqwest::Client::new()
            .post(format!("http://{addr}/v1/agents/runs"))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn cancel_returns_the_cancelled_run() {
        let state = app_state().await;
        let addr = spawn_app(state).await;
        let client = reqwest::Client::new();

        let run: Value = client
            .post(format!("http://{addr}/v1/agents/runs"))
            .json(&run_body())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let run_id = run["id"].as_str().unwrap();

        let cancelled: Value = client
            .post(format!("http://{addr}/v1/agents/runs/{run_id}/cancel"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        // Either it was cancelled in time, or it had already failed (no
        // routable model) — both are terminal and returned as-is.
        assert!(matches!(
            cancelled["status"].as_str().unwrap(),
            "cancelled" | "failed"
        ));
    }

    #[tokio::test]
    async fn event_feed_replays_snapshot_and_terminates() {
        let state = app_state().await;
        let addr = spawn_app(state).await;
        let client = reqwest::Client::new();

        let run: Value = client
            .post(format!("http://{addr}/v1/agents/runs"))
            .json(&run_body())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let run_id = run["id"].as_str().unwrap();

        // Let the run reach its terminal state (fails fast: no model).
        for _ in 0..100 {
            let current: Value = client
                .get(format!("http://{addr}/v1/agents/runs/{run_id}"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if current["status"] != "queued" && current["status"] != "running" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let feed = client
            .get(format!("http://{addr}/v1/agents/runs/{run_id}/events"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        assert!(feed.contains("event: run.update"));
        assert!(feed.contains("event: run.completed"));
        assert!(feed.contains("data: [DONE]"));
    }
}
