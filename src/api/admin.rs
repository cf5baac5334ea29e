//! Admin API — operator-facing model lifecycle and introspection endpoints.
//!
//! These endpoints are served on a separate port so they can be
//! network-restricted independently of the client API (e.g. accessible only
//! from an internal network, never exposed to the internet).

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    download::is_local_snapshot_complete,
    error::LmxError,
    inference::LoadRequest,
    registry::{AutotuneMetrics, CompatFilter, CompatOutcome},
};

use super::AppState;

/// Build the admin-facing axum router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/admin/status", get(status))
        .route("/admin/models", get(list_models))
        .route("/admin/models/load", post(load_model))
        .route("/admin/models/confirm-load", post(confirm_load))
        .route("/admin/models/unload", post(unload_model))
        .route("/admin/models/probe", post(probe_model))
        .route("/admin/models/compatibility", get(compatibility))
        .route("/admin/models/autotune", get(get_autotune).post(save_autotune))
        .route("/admin/models/evict-idle", post(evict_idle))
        .route("/admin/downloads", get(list_downloads).post(start_download))
        .route("/admin/downloads/{download_id}", get(download_progress))
        .route("/admin/drain", post(drain))
        .with_state(state)
}

/// GET /admin/status — serving vitals for dashboards.
pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let memory = state.engine.memory().reading();
    Json(json!({
        "status": "ok",
        "uptime_sec": state.started_at.elapsed().as_secs(),
        "loaded_models": state.engine.get_loaded_models().len(),
        "memory": {
            "total_gb": memory.total_gb,
            "used_gb": memory.used_gb,
            "usage_percent": memory.usage_percent,
            "threshold_percent": state.engine.memory().threshold_percent(),
        },
        "concurrency": {
            "limit": state.engine.current_concurrency_limit(),
            "in_flight": state.engine.in_flight_count(),
            "waiting": state.engine.waiting_queue_count(),
            "last_adapt_reason": state.engine.last_adapt_reason(),
        },
    }))
}

/// GET /admin/models — loaded models plus the readiness map.
pub async fn list_models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness: Value = state
        .engine
        .readiness_snapshot()
        .into_iter()
        .map(|(id, record)| (id, serde_json::to_value(record).unwrap_or(Value::Null)))
        .collect::<serde_json::Map<_, _>>()
        .into();
    Json(json!({
        "models": state.engine.get_loaded_models(),
        "readiness": readiness,
        "prefetch_suggestions": state.engine.suggest_prefetch_models(5),
    }))
}

#[derive(Debug, Deserialize)]
pub struct LoadModelBody {
    pub model_id: String,
    #[serde(default)]
    pub auto_download: Option<bool>,
    #[serde(default)]
    pub allow_unsupported_runtime: Option<bool>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub performance_overrides: Option<Value>,
    #[serde(default)]
    pub keep_alive_sec: Option<u64>,
    #[serde(default)]
    pub max_context_length: Option<u32>,
}

/// POST /admin/models/load — load now, or report what download is needed.
pub async fn load_model(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoadModelBody>,
) -> Result<axum::response::Response, LmxError> {
    if body.max_context_length.is_some() {
        return Err(LmxError::NotSupported {
            message: "max_context_length is not supported; set num_ctx per request instead"
                .into(),
        });
    }

    if needs_download(&state, &body.model_id) {
        if body.auto_download.unwrap_or(false) {
            let task = state.downloads.start(&body.model_id, None, &[], &[])?;
            return Ok((
                StatusCode::ACCEPTED,
                Json(json!({
                    "status": "downloading",
                    "download_id": task.download_id,
                    "progress_url": format!("/admin/downloads/{}", task.download_id),
                })),
            )
                .into_response());
        }
        let token = state.issue_confirmation_token(&body.model_id);
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "download_required",
                "confirmation_token": token,
            })),
        )
            .into_response());
    }

    let info = state
        .engine
        .load_model(LoadRequest {
            model_id: body.model_id,
            use_batching: None,
            performance_overrides: body.performance_overrides,
            keep_alive_sec: body.keep_alive_sec,
            allow_unsupported_runtime: body.allow_unsupported_runtime.unwrap_or(false),
            preferred_backend: body.backend,
        })
        .await?;
    Ok(Json(json!({ "status": "loaded", "model": info })).into_response())
}

/// Whether loading this model would first require a snapshot download.
///
/// Attach-mode runtimes serve from their own storage, so only spawn-mode
/// backends gate on the local snapshot.
fn needs_download(state: &AppState, model_id: &str) -> bool {
    let spawn_mode = state
        .config
        .backend_preferences()
        .first()
        .map(|kind| kind.as_str())
        .and_then(|kind| state.config.models.runtimes.get(kind))
        .is_none_or(|runtime| runtime.base_url.is_none());
    if !spawn_mode {
        return false;
    }
    let cache_dir = state
        .config
        .downloads
        .cache_dir
        .clone()
        .unwrap_or_else(|| state.config.state_dir().join("models"));
    !is_local_snapshot_complete(&cache_dir, model_id)
}

#[derive(Debug, Deserialize)]
pub struct ConfirmLoadBody {
    pub confirmation_token: String,
}

/// POST /admin/models/confirm-load — exchange a token for a download.
pub async fn confirm_load(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ConfirmLoadBody>,
) -> Result<axum::response::Response, LmxError> {
    let token = state
        .take_confirmation_token(&body.confirmation_token)
        .ok_or(LmxError::TokenNotFound)?;
    if token.expires_at < chrono::Utc::now() {
        return Err(LmxError::TokenExpired);
    }

    let task = state.downloads.start(&token.model_id, None, &[], &[])?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "downloading",
            "model_id": token.model_id,
            "download_id": task.download_id,
            "progress_url": format!("/admin/downloads/{}", task.download_id),
        })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct UnloadModelBody {
    pub model_id: String,
}

/// POST /admin/models/unload
pub async fn unload_model(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UnloadModelBody>,
) -> Result<Json<Value>, LmxError> {
    let freed = state.engine.unload_model(&body.model_id, "manual").await?;
    Ok(Json(json!({
        "status": "unloaded",
        "model_id": body.model_id,
        "memory_freed_gb": freed,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ProbeModelBody {
    pub model_id: String,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub allow_unsupported_runtime: Option<bool>,
}

/// POST /admin/models/probe — candidate outcomes without loading anything.
pub async fn probe_model(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ProbeModelBody>,
) -> Result<Json<Value>, LmxError> {
    let result = state
        .engine
        .probe_model_backends(
            &body.model_id,
            body.timeout_sec.unwrap_or(30),
            body.allow_unsupported_runtime.unwrap_or(false),
        )
        .await?;
    Ok(Json(serde_json::to_value(result).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
pub struct CompatibilityQuery {
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
}

/// GET /admin/models/compatibility
pub async fn compatibility(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CompatibilityQuery>,
) -> Json<Value> {
    let outcome = match query.outcome.as_deref() {
        Some("pass") => Some(CompatOutcome::Pass),
        Some("fail") => Some(CompatOutcome::Fail),
        Some("unknown") => Some(CompatOutcome::Unknown),
        _ => None,
    };
    let rows = state.engine.compatibility_rows(&CompatFilter {
        model_id: query.model_id,
        backend: query.backend,
        outcome,
        since: None,
    });
    Json(json!({
        "rows": rows,
        "summary": state.engine.compatibility_summary(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct AutotuneQuery {
    pub model_id: String,
    pub backend: String,
}

/// GET /admin/models/autotune?model_id=…&backend=…
pub async fn get_autotune(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AutotuneQuery>,
) -> Json<Value> {
    let record = state.engine.get_tuned_profile(&query.model_id, &query.backend);
    Json(json!({ "record": record }))
}

#[derive(Debug, Deserialize)]
pub struct SaveAutotuneBody {
    pub model_id: String,
    pub backend: String,
    pub backend_version: String,
    pub profile: Value,
    pub metrics: AutotuneMetrics,
    #[serde(default)]
    pub force: bool,
}

/// POST /admin/models/autotune — record a tuned profile.
pub async fn save_autotune(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SaveAutotuneBody>,
) -> Json<Value> {
    let record = state.engine.save_tuned_profile(
        &body.model_id,
        &body.backend,
        &body.backend_version,
        body.profile,
        body.metrics,
        body.force,
    );
    Json(json!({ "record": record }))
}

/// POST /admin/models/evict-idle — run a TTL sweep now.
pub async fn evict_idle(State(state): State<Arc<AppState>>) -> Json<Value> {
    let evicted = state
        .engine
        .evict_idle_models(state.config.models.default_keep_alive_sec)
        .await;
    Json(json!({ "evicted": evicted }))
}

#[derive(Debug, Deserialize)]
pub struct StartDownloadBody {
    pub repo_id: String,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub allow_patterns: Vec<String>,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
}

/// POST /admin/downloads
pub async fn start_download(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartDownloadBody>,
) -> Result<Json<Value>, LmxError> {
    let task = state.downloads.start(
        &body.repo_id,
        body.revision.as_deref(),
        &body.allow_patterns,
        &body.ignore_patterns,
    )?;
    Ok(Json(serde_json::to_value(task).unwrap_or(Value::Null)))
}

/// GET /admin/downloads
pub async fn list_downloads(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "downloads": state.downloads.list() }))
}

/// GET /admin/downloads/{download_id}
pub async fn download_progress(
    State(state): State<Arc<AppState>>,
    Path(download_id): Path<String>,
) -> Result<Json<Value>, LmxError> {
    let task = state
        .downloads
        .get(&download_id)
        .ok_or(LmxError::DownloadNotFound { download_id })?;
    Ok(Json(serde_json::to_value(task).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
pub struct DrainBody {
    #[serde(default = "default_drain_timeout")]
    pub timeout_sec: u64,
}

fn default_drain_timeout() -> u64 {
    30
}

/// POST /admin/drain — wait for in-flight requests to finish.
pub async fn drain(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DrainBody>,
) -> Json<Value> {
    let drained = state
        .engine
        .drain(std::time::Duration::from_secs(body.timeout_sec))
        .await;
    Json(json!({ "drained": drained }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        agents::{AgentRuntime, RunStore},
        config::{Config, RuntimeConfig},
        download::{DownloadCoordinator, Fetcher, ProgressFn},
        events::EventBus,
        inference::InferenceEngine,
        memory::MemoryMonitor,
        registry::{AutotuneRegistry, CompatibilityRegistry},
    };
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct SlowFetcher;

    #[async_trait]
    impl Fetcher for SlowFetcher {
        async fn fetch(
            &self,
            _repo_id: &str,
            _revision: Option<&str>,
            _dest: &std::path::Path,
            progress: ProgressFn,
            cancel: CancellationToken,
        ) -> anyhow::Result<()> {
            progress(1024, Some(4096));
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => Ok(()),
                _ = cancel.cancelled() => anyhow::bail!("download cancelled"),
            }
        }
    }

    /// Attach-mode state: runtimes point at the wiremock server, so loads
    /// never require a download.
    async fn attach_state(runtime_url: &str) -> Arc<AppState> {
        build_state(Some(runtime_url)).await
    }

    /// Spawn-mode state: no base_url, so loads gate on local snapshots.
    async fn spawn_mode_state() -> Arc<AppState> {
        build_state(None).await
    }

    async fn build_state(runtime_url: Option<&str>) -> Arc<AppState> {
        let mut config = Config::default();
        config.models.backend_preferences = vec!["vllm".into()];
        config.models.gguf_fallback = false;
        config.inference.loader_isolation = false;
        if let Some(url) = runtime_url {
            config.models.runtimes.insert(
                "vllm".into(),
                RuntimeConfig {
                    command: None,
                    base_url: Some(url.to_string()),
                    port_base: 8300,
                },
            );
        }
        let config = Arc::new(config);
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
        let downloads = Arc::new(
            DownloadCoordinator::new(state_dir.join("models"), 5.0, Arc::new(SlowFetcher))
                .with_free_disk_probe(|_| 100.0),
        );
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

    async fn mount_runtime(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "OK" } }],
                "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn status_reports_vitals() {
        let server = MockServer::start().await;
        let state = attach_state(&server.uri()).await;
        let addr = spawn_app(state).await;

        let body: Value = reqwest::get(format!("http://{addr}/admin/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["loaded_models"], 0);
        assert_eq!(body["concurrency"]["limit"], 4);
        assert!(body["memory"]["usage_percent"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn load_then_unload_via_admin() {
        let server = MockServer::start().await;
        mount_runtime(&server).await;
        let state = attach_state(&server.uri()).await;
        let addr = spawn_app(state).await;
        let client = reqwest::Client::new();

        let loaded = client
            .post(format!("http://{addr}/admin/models/load"))
            .json(&json!({ "model_id": "org/m" }))
            .send()
            .await
            .unwrap();
        assert_eq!(loaded.status(), 200);
        let body: Value = loaded.json().await.unwrap();
        assert_eq!(body["status"], "loaded");
        assert_eq!(body["model"]["model_id"], "org/m");

        let unloaded = client
            .post(format!("http://{addr}/admin/models/unload"))
            .json(&json!({ "model_id": "org/m" }))
            .send()
            .await
            .unwrap();
        assert_eq!(unloaded.status(), 200);

        let missing = client
            .post(format!("http://{addr}/admin/models/unload"))
            .json(&json!({ "model_id": "org/m" }))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
    }

    #[tokio::test]
    async fn max_context_length_is_rejected_as_not_supported() {
        let server = MockServer::start().await;
        let state = attach_state(&server.uri()).await;
        let addr = spawn_app(state).await;

        let response = reqwest::Client::new()
            .post(format!("http://{addr}/admin/models/load"))
            .json(&json!({ "model_id": "org/m", "max_context_length": 8192 }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"]["code"], "not_supported");
    }

    #[tokio::test]
    async fn missing_snapshot_requires_confirmation_then_downloads() {
        let state = spawn_mode_state().await;
        let addr = spawn_app(state).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("http://{addr}/admin/models/load"))
            .json(&json!({ "model_id": "org/not-downloaded" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 202);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["status"], "download_required");
        let token = body["confirmation_token"].as_str().unwrap().to_string();

        let confirmed = client
            .post(format!("http://{addr}/admin/models/confirm-load"))
            .json(&json!({ "confirmation_token": token }))
            .send()
            .await
            .unwrap();
        assert_eq!(confirmed.status(), 202);
        let body: Value = confirmed.json().await.unwrap();
        assert_eq!(body["status"], "downloading");
        let progress_url = body["progress_url"].as_str().unwrap().to_string();

        let progress: Value = reqwest::get(format!("http://{addr}{progress_url}"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(progress["repo_id"], "org/not-downloaded");
    }

    #[tokio::test]
    async fn confirmation_token_is_single_use() {
        let state = spawn_mode_state().await;
        let token = state.issue_confirmation_token("org/m");
        let addr = spawn_app(state).await;
        let client = reqwest::Client::new();

        let first = client
            .post(format!("http://{addr}/admin/models/confirm-load"))
            .json(&json!({ "confirmation_token": token }))
            .send()
            .await
            .unwrap();
        assert_eq!(first.status(), 202);

        let second = client
            .post(format!("http://{addr}/admin/models/confirm-load"))
            .json(&json!({ "confirmation_token": token }))
            .send()
            .await
            .unwrap();
        assert_eq!(second.status(), 404);
        let body: Value = second.json().await.unwrap();
        assert_eq!(body["error"]["code"], "token_not_found");
    }

    #[tokio::test]
    async fn auto_download_returns_progress_handle() {
        let state = spawn_mode_state().await;
        let addr = spawn_app(state).await;

        let response = reqwest::Client::new()
            .post(format!("http://{addr}/admin/models/load"))
            .json(&json!({ "model_id": "org/fresh", "auto_download": true }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 202);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["status"], "downloading");
        assert!(body["download_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn unknown_download_is_404() {
        let server = MockServer::start().await;
        let state = attach_state(&server.uri()).await;
        let addr = spawn_app(state).await;

        let response = reqwest::get(format!("http://{addr}/admin/downloads/nope"))
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn autotune_round_trips_through_admin() {
        let server = MockServer::start().await;
        let state = attach_state(&server.uri()).await;
        let addr = spawn_app(state).await;
        let client = reqwest::Client::new();

        let saved = client
            .post(format!("http://{addr}/admin/models/autotune"))
            .json(&json!({
                "model_id": "org/m",
                "backend": "vllm",
                "backend_version": "0.9",
                "profile": { "kv_bits": 4 },
                "metrics": {
                    "tokens_per_sec": 100.0,
                    "ttft_sec": 0.2,
                    "error_rate": 0.0,
                    "total_latency_sec": 1.0,
                    "queue_wait_sec": 0.0
                },
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(saved.status(), 200);

        let fetched: Value = client
            .get(format!(
                "http://{addr}/admin/models/autotune?model_id=org/m&backend=vllm"
            ))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(fetched["record"]["profile"]["kv_bits"], 4);
    }

    #[tokio::test]
    async fn compatibility_endpoint_filters_by_outcome() {
        let server = MockServer::start().await;
        mount_runtime(&server).await;
        let state = attach_state(&server.uri()).await;
        // A successful load leaves a pass row.
        state
            .engine
            .load_model(LoadRequest::new("org/m"))
            .await
            .unwrap();
        let addr = spawn_app(state).await;

        let body: Value = reqwest::get(format!(
            "http://{addr}/admin/models/compatibility?outcome=pass"
        ))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
        let rows = body["rows"].as_array().unwrap();
        assert!(!rows.is_empty());
        assert!(rows.iter().all(|r| r["outcome"] == "pass"));
        assert_eq!(body["summary"]["org/m"]["pass"], 1);
    }

    #[tokio::test]
    async fn drain_endpoint_reports_idle() {
        let server = MockServer::start().await;
        let state = attach_state(&server.uri()).await;
        let addr = spawn_app(state).await;

        let body: Value = reqwest::Client::new()
            .post(format!("http://{addr}/admin/drain"))
            .json(&json!({ "timeout_sec": 1 }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["drained"], true);
    }
}
