//! Model lifecycle: admission, load, warmup, canary, unload, eviction.
//!
//! All check-and-mutate admission work happens under a single async lock so
//! no two concurrent loads can both observe "not loaded" and proceed. Memory
//! is reserved per in-flight cold load — either `1.15 ×` an explicit
//! estimate, or all remaining headroom below the threshold when the size is
//! unknown (which prevents admitting two unknown-size loads at once).
//!
//! A successful load walks `admitted → loading → canary_pending → routable`;
//! the canary is the first real inference and an empty response fails it,
//! quarantining and unloading the model.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use serde_json::{json, Map, Value};

use crate::{
    backends::{
        launcher::{self, PortAllocator},
        BackendHandle, GenerateRequest, GgufAdapter, MlxLmAdapter, VllmAdapter,
    },
    concurrency::ConcurrencyController,
    config::{BackendKind, InferenceConfig, ModelsConfig, RuntimeConfig, SpeculativeConfig},
    download,
    error::LmxError,
    events::EventBus,
    memory::MemoryMonitor,
    policy::backend_candidates,
    registry::{
        AutotuneRegistry, CompatOutcome, CompatibilityRegistry, ReadinessState, ReadinessTracker,
    },
};

use super::types::{LoadedModel, ModelInfo, SpeculativeStatus};

/// Settle time after an LRU eviction before re-measuring memory, so the OS
/// has a chance to reclaim the evicted runtime's pages.
const EVICTION_SETTLE: Duration = Duration::from_millis(100);

/// Poll interval while waiting for another request's in-flight load.
const LOAD_WAIT_POLL: Duration = Duration::from_millis(50);

/// Model config signatures known to destabilise runtime bring-up on this
/// stack. Matched against `model_type` and `architectures` from the model's
/// local `config.json`.
const BLOCKED_RUNTIME_SIGNATURES: &[&str] = &["qwen3_next", "mamba2", "plamo2"];

/// One load request, normalized by the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct LoadRequest {
    pub model_id: String,
    pub use_batching: Option<bool>,
    pub performance_overrides: Option<Value>,
    pub keep_alive_sec: Option<u64>,
    pub allow_unsupported_runtime: bool,
    pub preferred_backend: Option<String>,
}

impl LoadRequest {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            ..Default::default()
        }
    }
}

/// The loaded-model map. Owned by the lifecycle manager; the executor reads
/// through `Arc` handles without touching lifecycle locks.
#[derive(Default)]
pub struct LoadedModels {
    map: std::sync::Mutex<HashMap<String, Arc<LoadedModel>>>,
}

impl LoadedModels {
    pub fn get(&self, model_id: &str) -> Option<Arc<LoadedModel>> {
        self.lock().get(model_id).cloned()
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.lock().contains_key(model_id)
    }

    pub fn insert(&self, model: Arc<LoadedModel>) {
        self.lock().insert(model.model_id.clone(), model);
    }

    pub fn remove(&self, model_id: &str) -> Option<Arc<LoadedModel>> {
        self.lock().remove(model_id)
    }

    pub fn snapshot(&self) -> Vec<Arc<LoadedModel>> {
        let mut all: Vec<_> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        all
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// The least-recently-used model, if any.
    pub fn lru(&self) -> Option<Arc<LoadedModel>> {
        self.lock()
            .values()
            .min_by_key(|m| m.last_used_at_ms())
            .cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<LoadedModel>>> {
        self.map.lock().expect("loaded models lock poisoned")
    }
}

/// Mutable admission bookkeeping, guarded by the load lock.
#[derive(Default)]
struct AdmissionState {
    loading: HashSet<String>,
    reservations_gb: HashMap<String, f64>,
}

impl AdmissionState {
    fn reserved_gb(&self) -> f64 {
        self.reservations_gb.values().sum()
    }
}

/// Per-candidate probe outcome, reported without mutating loaded state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProbeCandidate {
    pub backend: String,
    pub outcome: CompatOutcome,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProbeResult {
    pub recommended_backend: Option<String>,
    pub candidates: Vec<ProbeCandidate>,
}

pub struct ModelLifecycleManager {
    models: Arc<LoadedModels>,
    readiness: Arc<ReadinessTracker>,
    compatibility: Arc<CompatibilityRegistry>,
    autotune: Arc<AutotuneRegistry>,
    memory: Arc<MemoryMonitor>,
    concurrency: Arc<ConcurrencyController>,
    bus: EventBus,

    models_config: ModelsConfig,
    inference_config: InferenceConfig,
    speculative_config: SpeculativeConfig,
    cache_dir: PathBuf,

    load_lock: tokio::sync::Mutex<AdmissionState>,
    ports: HashMap<BackendKind, PortAllocator>,
    runtime_versions: std::sync::Mutex<HashMap<BackendKind, String>>,
}

impl ModelLifecycleManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        models: Arc<LoadedModels>,
        readiness: Arc<ReadinessTracker>,
        compatibility: Arc<CompatibilityRegistry>,
        autotune: Arc<AutotuneRegistry>,
        memory: Arc<MemoryMonitor>,
        concurrency: Arc<ConcurrencyController>,
        bus: EventBus,
        models_config: ModelsConfig,
        inference_config: InferenceConfig,
        speculative_config: SpeculativeConfig,
        cache_dir: PathBuf,
    ) -> Self {
        let ports = models_config
            .runtimes
            .iter()
            .filter_map(|(kind, runtime)| {
                BackendKind::parse(kind).map(|k| (k, PortAllocator::new(runtime.port_base)))
            })
            .collect();
        Self {
            models,
            readiness,
            compatibility,
            autotune,
            memory,
            concurrency,
            bus,
            models_config,
            inference_config,
            speculative_config,
            cache_dir,
            load_lock: tokio::sync::Mutex::new(AdmissionState::default()),
            ports,
            runtime_versions: std::sync::Mutex::new(HashMap::new()),
        }
    }

    // ── Admission ───────────────────────────────────────────────────────

    /// Load a model with admission control. Concurrent calls for the same id
    /// coalesce: exactly one constructs the backend, the rest wait and return
    /// the loaded model's info.
    pub async fn load_model(&self, request: LoadRequest) -> Result<ModelInfo, LmxError> {
        let model_id = request.model_id.clone();
        if model_id.contains("..") {
            return Err(LmxError::invalid_param(
                format!("Invalid model ID: '{model_id}'. Path traversal sequences are not allowed."),
                "model_id",
            ));
        }

        let wait_deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.inference_config.loader_timeout_sec.max(1) * 2);

        loop {
            let mut should_evict = false;
            {
                let mut state = self.load_lock.lock().await;

                if let Some(existing) = self.models.get(&model_id) {
                    tracing::info!(model_id, "model_already_loaded");
                    existing.refresh_last_used();
                    return Ok(ModelInfo::from_loaded(&existing));
                }

                if state.loading.contains(&model_id) {
                    drop(state);
                    // Another request is constructing this model — wait for it
                    // and return its result rather than duplicating the work.
                    if tokio::time::Instant::now() >= wait_deadline {
                        return Err(LmxError::ModelInUse { model_id });
                    }
                    tokio::time::sleep(LOAD_WAIT_POLL).await;
                    continue;
                }

                let current_usage = self.memory.usage_percent();
                let reserved_usage = self.memory.percent_from_gb(state.reserved_gb());
                let (reservation_gb, used_estimate) = self.resolve_admission_reservation(
                    request.performance_overrides.as_ref(),
                    current_usage,
                    reserved_usage,
                );
                let requested_usage = self.memory.percent_from_gb(reservation_gb);
                let projected_usage = current_usage + reserved_usage + requested_usage;

                let admitted = projected_usage <= self.memory.threshold_percent()
                    && (used_estimate || reservation_gb > 0.0);
                if admitted {
                    state.loading.insert(model_id.clone());
                    state.reservations_gb.insert(model_id.clone(), reservation_gb);
                } else {
                    should_evict = self.models_config.auto_evict_lru && !self.models.is_empty();
                    if !should_evict {
                        let reserved_reason = if reserved_usage > 0.0 {
                            "in-flight load reservations"
                        } else {
                            "current usage"
                        };
                        return Err(LmxError::InsufficientMemory {
                            message: format!(
                                "Insufficient memory headroom for loading '{model_id}': \
                                 current={current_usage:.1}% + reserved={reserved_usage:.1}% \
                                 + requested={requested_usage:.1}% = {projected_usage:.1}% \
                                 exceeds {:.0}% threshold ({reserved_reason}).",
                                self.memory.threshold_percent()
                            ),
                        });
                    }
                }
            }

            if should_evict {
                // Outside the lock — unload takes the same lock.
                if let Some(evicted) = self.evict_least_recently_used().await {
                    tracing::info!(evicted, loading = model_id, "lru_evicted_for_load");
                }
                tokio::time::sleep(EVICTION_SETTLE).await;
                continue;
            }
            break;
        }

        self.readiness
            .set_state(&model_id, ReadinessState::Admitted, None);

        let result = self.do_load(&request).await;

        {
            let mut state = self.load_lock.lock().await;
            state.loading.remove(&model_id);
            state.reservations_gb.remove(&model_id);
        }

        // Failed loads keep their readiness record: the crash counter must
        // accumulate across attempts so repeated failures quarantine.
        result
    }

    fn reservation_estimate_gb(&self, overrides: Option<&Value>) -> Option<f64> {
        let estimate = overrides?.get("memory_estimate_gb")?.as_f64()?;
        if estimate > 0.0 {
            Some(estimate * 1.15)
        } else {
            None
        }
    }

    /// `(reservation_gb, used_explicit_estimate)`. Without an estimate the
    /// whole remaining headroom is reserved.
    fn resolve_admission_reservation(
        &self,
        overrides: Option<&Value>,
        current_usage_percent: f64,
        reserved_usage_percent: f64,
    ) -> (f64, bool) {
        if let Some(estimated) = self.reservation_estimate_gb(overrides) {
            return (estimated, true);
        }
        let remaining_percent =
            self.memory.threshold_percent() - current_usage_percent - reserved_usage_percent;
        if remaining_percent <= 0.0 {
            return (0.0, false);
        }
        let total = self.memory.total_memory_gb();
        if total <= 0.0 {
            return (0.0, false);
        }
        ((remaining_percent / 100.0) * total, false)
    }

    // ── Load sequence ───────────────────────────────────────────────────

    async fn do_load(&self, request: &LoadRequest) -> Result<ModelInfo, LmxError> {
        let model_id = &request.model_id;
        let prefs = self.backend_preferences();
        let candidates = backend_candidates(
            model_id,
            &prefs,
            self.models_config.gguf_fallback,
            &self.compatibility,
            request.preferred_backend.as_deref(),
            request.allow_unsupported_runtime || request.preferred_backend.is_some(),
        )?;
        let selected = candidates.first().copied().unwrap_or(BackendKind::Vllm);

        // A gguf selection for a non-gguf repo needs a local equivalent file.
        let mut serve_target = model_id.clone();
        if selected == BackendKind::Gguf && !is_gguf_repo(model_id) {
            if !self.models_config.gguf_fallback {
                return Err(LmxError::NotSupported {
                    message: format!(
                        "Backend 'gguf' selected for '{model_id}' but GGUF fallback is disabled"
                    ),
                });
            }
            let equivalents =
                download::resolve_local_gguf_equivalents(&self.cache_dir, model_id);
            let Some(path) = equivalents.first() else {
                return Err(LmxError::ModelNotFound {
                    model_id: format!("{model_id} (no local GGUF equivalent)"),
                });
            };
            serve_target = path.to_string_lossy().into_owned();
        }

        // Runtime-signature blocklist only applies to vllm bring-up.
        if selected == BackendKind::Vllm {
            if let Some(signature) = self.detect_blocked_signature(model_id) {
                if !request.allow_unsupported_runtime {
                    let version_hint = format!(
                        "vllm={}",
                        self.runtime_version(BackendKind::Vllm)
                    );
                    tracing::warn!(model_id, signature, "model_runtime_incompatible_blocked");
                    self.readiness.set_state(
                        model_id,
                        ReadinessState::Quarantined,
                        Some(&format!("model_unsupported_backend:{signature}")),
                    );
                    self.record_compatibility(
                        model_id,
                        selected,
                        CompatOutcome::Fail,
                        Some(&format!("runtime_incompatible:{signature}")),
                        None,
                    );
                    return Err(LmxError::UnsupportedBackend {
                        model_id: model_id.clone(),
                        signature,
                        version_hint,
                    });
                }
                tracing::warn!(model_id, signature, "model_runtime_incompatibility_override");
            }
        }

        // Tuned profile underneath explicit overrides, explicit wins per key.
        let effective_overrides = self.merge_tuned_profile(
            model_id,
            selected,
            request.performance_overrides.as_ref(),
        );

        self.readiness
            .set_state(model_id, ReadinessState::Loading, None);

        // Out-of-process probe before the real vllm bring-up.
        if selected == BackendKind::Vllm && self.inference_config.loader_isolation {
            self.run_loader_probe(model_id, &serve_target).await?;
        }

        let speculative = self.resolve_speculative(&effective_overrides, selected)?;

        let memory_before = self.memory.used_memory_gb();
        let started = std::time::Instant::now();

        let backend = self.construct_backend(model_id, selected, &serve_target).await?;
        let backend_version = backend.version().to_string();
        self.runtime_versions
            .lock()
            .expect("runtime versions lock poisoned")
            .insert(selected, backend_version.clone());

        let memory_after = self.memory.used_memory_gb();
        let construction_gb = (memory_after - memory_before).max(0.0);

        if self.memory.usage_percent() > self.memory.threshold_percent() {
            backend.close().await;
            return Err(LmxError::InsufficientMemory {
                message: format!(
                    "Loading '{model_id}' pushed memory to {:.1}%, above the {:.0}% threshold; \
                     the backend was closed.",
                    self.memory.usage_percent(),
                    self.memory.threshold_percent()
                ),
            });
        }

        let explicit_estimate = request
            .performance_overrides
            .as_ref()
            .and_then(|o| o.get("memory_estimate_gb"))
            .and_then(Value::as_f64);
        let estimated_memory_gb = if construction_gb > 0.05 {
            construction_gb
        } else {
            explicit_estimate.unwrap_or(construction_gb)
        };

        let loaded = Arc::new(LoadedModel::new(
            model_id.clone(),
            backend,
            selected,
            estimated_memory_gb,
            self.resolve_context_length(model_id),
            request.use_batching.unwrap_or(self.models_config.use_batching),
            effective_overrides,
            request.keep_alive_sec,
            speculative,
        ));

        {
            let _state = self.load_lock.lock().await;
            self.models.insert(Arc::clone(&loaded));
        }
        self.readiness
            .set_state(model_id, ReadinessState::CanaryPending, None);
        self.bus.publish(
            "model_loaded",
            json!({
                "model_id": model_id,
                "backend": selected.as_str(),
                "memory_gb": estimated_memory_gb,
                "duration_sec": started.elapsed().as_secs_f64(),
            }),
        );

        self.warmup_model(&loaded).await;

        if let Err(error) = self.run_load_canary(&loaded).await {
            self.readiness.mark_failure(
                model_id,
                &error.to_string(),
                self.inference_config.quarantine_threshold,
            );
            // Canary failure quarantines regardless of the crash counter.
            self.readiness.set_state(
                model_id,
                ReadinessState::Quarantined,
                Some(&format!("model_canary_failed:{error}")),
            );
            self.record_compatibility(
                model_id,
                selected,
                CompatOutcome::Fail,
                Some(&format!("canary_failed:{error}")),
                None,
            );
            self.bus.publish(
                "model_canary_failed",
                json!({ "model_id": model_id, "backend": selected.as_str(), "error": error.to_string() }),
            );
            let _ = self.unload_model(model_id, "canary_failed").await;
            return Err(LmxError::ModelCanaryFailed {
                model_id: model_id.clone(),
                reason: error.to_string(),
            });
        }

        self.readiness
            .set_state(model_id, ReadinessState::Routable, Some("canary_ok"));
        self.record_compatibility(model_id, selected, CompatOutcome::Pass, Some("canary_ok"), None);
        self.bus.publish(
            "model_canary_passed",
            json!({ "model_id": model_id, "backend": selected.as_str() }),
        );

        self.concurrency.adapt(&self.memory);

        Ok(ModelInfo::from_loaded(&loaded))
    }

    async fn run_loader_probe(&self, model_id: &str, serve_target: &str) -> Result<(), LmxError> {
        let Some(runtime) = self.runtime_config(BackendKind::Vllm) else {
            return Ok(());
        };
        // Attach mode has no process to isolate.
        let Some(command) = runtime.command.clone().filter(|_| runtime.base_url.is_none()) else {
            return Ok(());
        };

        let port = self.allocate_port(BackendKind::Vllm);
        let health_url = format!("http://127.0.0.1:{port}{}", crate::backends::vllm::HEALTH_PATH);
        let report = launcher::probe_spawn(
            &command,
            serve_target,
            port,
            &health_url,
            Duration::from_secs(self.inference_config.loader_timeout_sec),
        )
        .await;

        if report.ok {
            return Ok(());
        }

        let reason = report
            .reason
            .clone()
            .unwrap_or_else(|| "model_probe_failed".into());
        let failure_reason = format!("model_probe_failed:{reason}");
        self.readiness.mark_failure(
            model_id,
            &failure_reason,
            self.inference_config.quarantine_threshold,
        );
        self.record_compatibility(
            model_id,
            BackendKind::Vllm,
            CompatOutcome::Fail,
            Some(&failure_reason),
            Some(json!({
                "exit_code": report.exit_code,
                "signal": report.signal,
                "loader_timeout_sec": self.inference_config.loader_timeout_sec,
            })),
        );
        Err(LmxError::ModelProbeFailed {
            model_id: model_id.to_string(),
            reason,
        })
    }

    async fn construct_backend(
        &self,
        model_id: &str,
        kind: BackendKind,
        serve_target: &str,
    ) -> Result<BackendHandle, LmxError> {
        let runtime = self.runtime_config(kind).cloned().unwrap_or_default();
        let timeout_ms = self.inference_config.timeout_sec * 1000;

        let (base_url, process) = if let Some(base_url) = runtime.base_url.clone() {
            (base_url, None)
        } else if let Some(command) = runtime.command.clone() {
            let port = self.allocate_port(kind);
            let health_path = match kind {
                BackendKind::Vllm => crate::backends::vllm::HEALTH_PATH,
                BackendKind::MlxLm => crate::backends::mlx_lm::HEALTH_PATH,
                BackendKind::Gguf => crate::backends::gguf::HEALTH_PATH,
            };
            let health_url = format!("http://127.0.0.1:{port}{health_path}");
            let process = launcher::spawn_runtime(
                &command,
                serve_target,
                port,
                &health_url,
                Duration::from_secs(self.inference_config.loader_timeout_sec),
            )
            .await?;
            (format!("http://127.0.0.1:{}", process.port), Some(process))
        } else {
            return Err(LmxError::NotSupported {
                message: format!(
                    "No runtime configured for backend '{kind}'; set either \
                     models.runtimes.{kind}.command or .base_url"
                ),
            });
        };

        let handle = match kind {
            BackendKind::Vllm => BackendHandle::Vllm(
                VllmAdapter::connect(model_id.to_string(), base_url, timeout_ms, process).await,
            ),
            BackendKind::MlxLm => BackendHandle::MlxLm(MlxLmAdapter::connect(
                model_id.to_string(),
                base_url,
                timeout_ms,
                process,
            )),
            BackendKind::Gguf => {
                BackendHandle::Gguf(GgufAdapter::connect(base_url, timeout_ms, process).await)
            }
        };

        // Attached servers were never health-gated by the launcher.
        if let Err(error) = handle.health_check().await {
            handle.close().await;
            return Err(LmxError::ModelProbeFailed {
                model_id: model_id.to_string(),
                reason: format!("runtime unreachable: {error}"),
            });
        }

        Ok(handle)
    }

    async fn warmup_model(&self, loaded: &LoadedModel) {
        let request = GenerateRequest {
            messages: vec![json!({"role": "user", "content": "Hi"})],
            temperature: 0.0,
            max_tokens: 16,
            top_p: 1.0,
            ..Default::default()
        };
        let started = std::time::Instant::now();
        match loaded.backend.generate(request).await {
            Ok(_) => tracing::info!(
                model_id = loaded.model_id,
                warmup_ms = started.elapsed().as_millis() as u64,
                "model_warmup_complete"
            ),
            Err(error) => tracing::warn!(
                model_id = loaded.model_id,
                %error,
                "model_warmup_failed"
            ),
        }
    }

    async fn run_load_canary(&self, loaded: &LoadedModel) -> anyhow::Result<()> {
        let request = GenerateRequest {
            messages: vec![json!({"role": "user", "content": "Reply with exactly: OK"})],
            temperature: 0.0,
            max_tokens: 8,
            top_p: 1.0,
            ..Default::default()
        };
        let output = loaded.backend.generate(request).await?;
        anyhow::ensure!(!output.text.trim().is_empty(), "empty_canary_response");
        Ok(())
    }

    // ── Unload / eviction ───────────────────────────────────────────────

    /// Remove a model from service. Readiness is cleared — except after a
    /// canary failure, where the quarantine record must outlive the unload.
    pub async fn unload_model(&self, model_id: &str, reason: &str) -> Result<f64, LmxError> {
        let loaded = {
            let _state = self.load_lock.lock().await;
            self.models.remove(model_id).ok_or_else(|| LmxError::ModelNotFound {
                model_id: model_id.to_string(),
            })?
        };

        if reason != "canary_failed" {
            self.readiness.clear(model_id);
        }

        let memory_before = self.memory.used_memory_gb();
        loaded.backend.close().await;
        let freed = (memory_before - self.memory.used_memory_gb()).max(0.0);

        tracing::info!(model_id, reason, memory_freed_gb = freed, "model_unloaded");
        self.bus.publish(
            "model_unloaded",
            json!({ "model_id": model_id, "memory_freed_gb": freed, "reason": reason }),
        );

        self.concurrency.adapt(&self.memory);
        Ok(freed)
    }

    async fn evict_least_recently_used(&self) -> Option<String> {
        let lru = self.models.lru()?;
        let model_id = lru.model_id.clone();
        tracing::info!(
            model_id,
            request_count = lru.request_count(),
            "lru_eviction"
        );
        drop(lru);
        match self.unload_model(&model_id, "lru").await {
            Ok(_) => Some(model_id),
            Err(error) => {
                tracing::warn!(model_id, %error, "lru_eviction_failed");
                None
            }
        }
    }

    /// Unload models idle past their TTL. A per-model `keep_alive_sec`
    /// overrides `default_ttl`; zero pins the model.
    pub async fn evict_idle_models(&self, default_ttl_sec: u64) -> Vec<String> {
        let mut evicted = Vec::new();
        for loaded in self.models.snapshot() {
            let effective_ttl = loaded.keep_alive_sec.unwrap_or(default_ttl_sec);
            if effective_ttl == 0 {
                continue;
            }
            let idle = loaded.idle_seconds();
            if idle > effective_ttl as f64 {
                tracing::info!(
                    model_id = loaded.model_id,
                    idle_seconds = idle,
                    ttl_seconds = effective_ttl,
                    per_model_override = loaded.keep_alive_sec.is_some(),
                    "ttl_eviction"
                );
                match self.unload_model(&loaded.model_id, "ttl").await {
                    Ok(_) => evicted.push(loaded.model_id.clone()),
                    Err(error) => {
                        tracing::error!(model_id = loaded.model_id, %error, "ttl_eviction_failed");
                    }
                }
            }
        }
        evicted
    }

    // ── Probe ───────────────────────────────────────────────────────────

    /// Probe each candidate backend without mutating loaded state.
    pub async fn probe_model_backends(
        &self,
        model_id: &str,
        timeout_sec: u64,
        allow_unsupported_runtime: bool,
    ) -> Result<ProbeResult, LmxError> {
        let prefs = self.backend_preferences();
        let candidates = backend_candidates(
            model_id,
            &prefs,
            self.models_config.gguf_fallback,
            &self.compatibility,
            None,
            allow_unsupported_runtime,
        )?;

        let mut results = Vec::new();
        for kind in candidates {
            let candidate = match kind {
                BackendKind::Gguf => self.probe_gguf(model_id),
                BackendKind::Vllm | BackendKind::MlxLm => {
                    self.probe_runtime(model_id, kind, timeout_sec).await
                }
            };
            results.push(candidate);
        }

        let recommended = results
            .iter()
            .find(|c| c.outcome == CompatOutcome::Pass)
            .map(|c| c.backend.clone());

        Ok(ProbeResult {
            recommended_backend: recommended,
            candidates: results,
        })
    }

    fn probe_gguf(&self, model_id: &str) -> ProbeCandidate {
        let present = if is_gguf_repo(model_id) {
            download::is_local_snapshot_complete(&self.cache_dir, model_id)
        } else {
            !download::resolve_local_gguf_equivalents(&self.cache_dir, model_id).is_empty()
        };
        ProbeCandidate {
            backend: BackendKind::Gguf.as_str().to_string(),
            outcome: if present { CompatOutcome::Pass } else { CompatOutcome::Fail },
            reason: (!present).then(|| "no local gguf snapshot".to_string()),
        }
    }

    async fn probe_runtime(
        &self,
        model_id: &str,
        kind: BackendKind,
        timeout_sec: u64,
    ) -> ProbeCandidate {
        let backend = kind.as_str().to_string();
        let Some(runtime) = self.runtime_config(kind) else {
            return ProbeCandidate {
                backend,
                outcome: CompatOutcome::Unknown,
                reason: Some("no runtime configured".into()),
            };
        };

        if let Some(base_url) = &runtime.base_url {
            let health_path = match kind {
                BackendKind::Vllm => crate::backends::vllm::HEALTH_PATH,
                _ => crate::backends::mlx_lm::HEALTH_PATH,
            };
            let url = format!("{}{health_path}", base_url.trim_end_matches('/'));
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(timeout_sec.max(1)))
                .build()
                .expect("failed to build reqwest client");
            let ok = matches!(client.get(&url).send().await, Ok(r) if r.status().is_success());
            return ProbeCandidate {
                backend,
                outcome: if ok { CompatOutcome::Pass } else { CompatOutcome::Fail },
                reason: (!ok).then(|| format!("runtime unreachable at {url}")),
            };
        }

        if let Some(command) = &runtime.command {
            let port = self.allocate_port(kind);
            let health_path = match kind {
                BackendKind::Vllm => crate::backends::vllm::HEALTH_PATH,
                _ => crate::backends::mlx_lm::HEALTH_PATH,
            };
            let health_url = format!("http://127.0.0.1:{port}{health_path}");
            let report = launcher::probe_spawn(
                command,
                model_id,
                port,
                &health_url,
                Duration::from_secs(timeout_sec.max(1)),
            )
            .await;
            return ProbeCandidate {
                backend,
                outcome: if report.ok { CompatOutcome::Pass } else { CompatOutcome::Fail },
                reason: report.reason,
            };
        }

        ProbeCandidate {
            backend,
            outcome: CompatOutcome::Unknown,
            reason: Some("no runtime configured".into()),
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn backend_preferences(&self) -> Vec<BackendKind> {
        self.models_config
            .backend_preferences
            .iter()
            .filter_map(|s| BackendKind::parse(s))
            .collect()
    }

    fn runtime_config(&self, kind: BackendKind) -> Option<&RuntimeConfig> {
        self.models_config.runtimes.get(kind.as_str())
    }

    fn allocate_port(&self, kind: BackendKind) -> u16 {
        self.ports
            .get(&kind)
            .map(|p| p.allocate())
            .unwrap_or(8300)
    }

    fn runtime_version(&self, kind: BackendKind) -> String {
        self.runtime_versions
            .lock()
            .expect("runtime versions lock poisoned")
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| "unknown".into())
    }

    fn record_compatibility(
        &self,
        model_id: &str,
        kind: BackendKind,
        outcome: CompatOutcome,
        reason: Option<&str>,
        metadata: Option<Value>,
    ) {
        let row = self.compatibility.record(
            model_id,
            kind.as_str(),
            &self.runtime_version(kind),
            outcome,
            reason,
            metadata,
        );
        self.bus.publish(
            "model_compatibility_recorded",
            serde_json::to_value(&row).unwrap_or(Value::Null),
        );
    }

    fn merge_tuned_profile(
        &self,
        model_id: &str,
        kind: BackendKind,
        explicit: Option<&Value>,
    ) -> Value {
        let tuned = self
            .autotune
            .get(model_id, kind.as_str(), &self.runtime_version(kind))
            .map(|record| record.profile);

        let mut merged: Map<String, Value> = tuned
            .as_ref()
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let override_keys: Vec<String> = explicit
            .and_then(Value::as_object)
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default();
        if let Some(explicit) = explicit.and_then(Value::as_object) {
            for (key, value) in explicit {
                merged.insert(key.clone(), value.clone());
            }
        }
        if tuned.is_some() && !merged.is_empty() {
            tracing::info!(
                model_id,
                backend = kind.as_str(),
                override_keys = ?override_keys,
                "autotune_profile_applied"
            );
        }
        Value::Object(merged)
    }

    fn resolve_speculative(
        &self,
        overrides: &Value,
        kind: BackendKind,
    ) -> Result<SpeculativeStatus, LmxError> {
        let spec = overrides.get("speculative").and_then(Value::as_object);

        let draft_model = spec
            .and_then(|s| s.get("draft_model"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| self.speculative_config.draft_model.clone());

        if draft_model.is_none() {
            return Ok(SpeculativeStatus {
                requested: false,
                active: false,
                reason: Some("not_requested".into()),
                draft_model: None,
                num_tokens: None,
            });
        }

        let num_tokens = spec
            .and_then(|s| s.get("num_tokens"))
            .and_then(Value::as_u64)
            .map(|n| n as u32)
            .or(self.speculative_config.num_tokens);
        let require_supported = spec
            .and_then(|s| s.get("require_supported"))
            .and_then(Value::as_bool)
            .unwrap_or(self.speculative_config.require_supported);

        match kind {
            BackendKind::Vllm => Ok(SpeculativeStatus {
                requested: true,
                active: true,
                reason: None,
                draft_model,
                num_tokens,
            }),
            BackendKind::MlxLm | BackendKind::Gguf => {
                if require_supported {
                    return Err(LmxError::NotSupported {
                        message: format!(
                            "Speculative decoding is not supported on the '{kind}' backend. \
                             Disable speculative settings for this model (or set \
                             `speculative.require_supported=false`) or use the vllm backend."
                        ),
                    });
                }
                let reason = format!("backend_unsupported:{kind}");
                tracing::warn!(backend = kind.as_str(), reason, "speculative_not_supported_backend");
                Ok(SpeculativeStatus {
                    requested: true,
                    active: false,
                    reason: Some(reason),
                    draft_model,
                    num_tokens,
                })
            }
        }
    }

    fn detect_blocked_signature(&self, model_id: &str) -> Option<String> {
        let config_path = download::local_model_dir(&self.cache_dir, model_id).join("config.json");
        let content = std::fs::read_to_string(config_path).ok()?;
        let config: Value = serde_json::from_str(&content).ok()?;

        let mut hints: Vec<String> = Vec::new();
        if let Some(model_type) = config.get("model_type").and_then(Value::as_str) {
            hints.push(model_type.to_ascii_lowercase());
        }
        if let Some(architectures) = config.get("architectures").and_then(Value::as_array) {
            hints.extend(
                architectures
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_ascii_lowercase),
            );
        }

        for signature in BLOCKED_RUNTIME_SIGNATURES {
            if hints.iter().any(|h| h.contains(signature)) {
                return Some((*signature).to_string());
            }
        }
        None
    }

    fn resolve_context_length(&self, model_id: &str) -> Option<u32> {
        let config_path = download::local_model_dir(&self.cache_dir, model_id).join("config.json");
        let content = std::fs::read_to_string(config_path).ok()?;
        let config: Value = serde_json::from_str(&content).ok()?;
        config
            .get("max_position_embeddings")
            .or_else(|| config.get("n_ctx"))
            .and_then(Value::as_u64)
            .map(|n| n as u32)
    }
}

fn is_gguf_repo(model_id: &str) -> bool {
    let lower = model_id.to_ascii_lowercase();
    lower.ends_with(".gguf") || lower.contains("gguf")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConcurrencyConfig;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        manager: ModelLifecycleManager,
        models: Arc<LoadedModels>,
        readiness: Arc<ReadinessTracker>,
        compatibility: Arc<CompatibilityRegistry>,
        memory: Arc<MemoryMonitor>,
        bus: EventBus,
    }

    /// Mount the endpoints a healthy attached vllm runtime answers.
    async fn mount_healthy_runtime(server: &MockServer, canary_reply: &str) {
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": canary_reply } }],
                "usage": { "prompt_tokens": 4, "completion_tokens": 1 }
            })))
            .mount(server)
            .await;
    }

    fn harness(server_url: &str, memory: MemoryMonitor, auto_evict: bool) -> Harness {
        let bus = EventBus::new(64);
        let models = Arc::new(LoadedModels::default());
        let readiness = Arc::new(ReadinessTracker::new(bus.clone()));
        let compatibility = Arc::new(CompatibilityRegistry::new(64));
        let autotune = Arc::new(AutotuneRegistry::new());
        let memory = Arc::new(memory);
        let concurrency = Arc::new(ConcurrencyController::new(&ConcurrencyConfig::default()));

        let mut models_config = ModelsConfig::default();
        models_config.backend_preferences = vec!["vllm".into()];
        models_config.gguf_fallback = false;
        models_config.auto_evict_lru = auto_evict;
        models_config.runtimes.insert(
            "vllm".into(),
            RuntimeConfig {
                command: None,
                base_url: Some(server_url.to_string()),
                port_base: 8300,
            },
        );

        let mut inference_config = InferenceConfig::default();
        inference_config.loader_isolation = false;
        inference_config.timeout_sec = 5;

        let manager = ModelLifecycleManager::new(
            Arc::clone(&models),
            Arc::clone(&readiness),
            Arc::clone(&compatibility),
            autotune,
            Arc::clone(&memory),
            concurrency,
            bus.clone(),
            models_config,
            inference_config,
            SpeculativeConfig::default(),
            std::env::temp_dir().join("opta-lmx-tests"),
        );

        Harness {
            manager,
            models,
            readiness,
            compatibility,
            memory,
            bus,
        }
    }

    // -----------------------------------------------------------------------
    // Load path
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn successful_load_promotes_to_routable() {
        let server = MockServer::start().await;
        mount_healthy_runtime(&server, "OK").await;
        let h = harness(&server.uri(), MemoryMonitor::fixed(90.0, 128.0, 51.2), false);

        let info = h
            .manager
            .load_model(LoadRequest::new("org/model"))
            .await
            .unwrap();
        assert!(info.loaded);
        assert_eq!(info.backend, "vllm");
        assert!(h.models.contains("org/model"));
        assert!(h.readiness.is_routable("org/model"));

        // Canary pass leaves a compatibility row.
        assert_eq!(
            h.compatibility.latest_outcome("org/model", "vllm"),
            Some(CompatOutcome::Pass)
        );
    }

    #[tokio::test]
    async fn second_load_returns_existing_without_reconstruction() {
        let server = MockServer::start().await;
        mount_healthy_runtime(&server, "OK").await;
        let h = harness(&server.uri(), MemoryMonitor::fixed(90.0, 128.0, 51.2), false);

        h.manager.load_model(LoadRequest::new("org/model")).await.unwrap();
        let requests_after_first = server.received_requests().await.unwrap().len();

        let info = h.manager.load_model(LoadRequest::new("org/model")).await.unwrap();
        assert!(info.loaded);
        // No further backend traffic: the hit path only bumps last_used.
        assert_eq!(
            server.received_requests().await.unwrap().len(),
            requests_after_first
        );
    }

    #[tokio::test]
    async fn concurrent_loads_coalesce_to_one_construction() {
        let server = MockServer::start().await;
        mount_healthy_runtime(&server, "OK").await;
        let h = Arc::new(harness(
            &server.uri(),
            MemoryMonitor::fixed(90.0, 128.0, 51.2),
            false,
        ));

        let (a, b) = tokio::join!(
            h.manager.load_model(LoadRequest::new("org/model")),
            h.manager.load_model(LoadRequest::new("org/model")),
        );
        let a = a.unwrap();
        let b = b.unwrap();
        assert!(a.loaded && b.loaded);
        assert_eq!(a.model_id, b.model_id);
        assert_eq!(h.models.len(), 1);

        // Exactly one construction: one warmup + one canary call.
        let chat_calls = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/v1/chat/completions")
            .count();
        assert_eq!(chat_calls, 2);
    }

    #[tokio::test]
    async fn path_traversal_is_rejected_at_admission() {
        let server = MockServer::start().await;
        let h = harness(&server.uri(), MemoryMonitor::fixed(90.0, 128.0, 51.2), false);
        let err = h
            .manager
            .load_model(LoadRequest::new("../etc/passwd"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request_error");
    }

    // -----------------------------------------------------------------------
    // Admission math
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn no_headroom_without_estimate_is_memory_error() {
        let server = MockServer::start().await;
        // 91% used with a 90% threshold: no headroom at all.
        let h = harness(&server.uri(), MemoryMonitor::fixed(90.0, 128.0, 116.5), false);

        let err = h
            .manager
            .load_model(LoadRequest::new("org/model"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "insufficient_memory");
        let message = err.to_string();
        assert!(message.contains("current="));
        assert!(message.contains("reserved="));
        assert!(message.contains("requested="));
        // Admission failures leave no residual readiness state.
        assert!(h.readiness.get("org/model").is_none());
    }

    #[tokio::test]
    async fn explicit_estimate_reserves_with_fifteen_percent_margin() {
        let server = MockServer::start().await;
        mount_healthy_runtime(&server, "OK").await;
        // 50% used, 90% threshold, 128 GB total: 40% headroom = 51.2 GB.
        let h = harness(&server.uri(), MemoryMonitor::fixed(90.0, 128.0, 64.0), false);

        // 44 GB × 1.15 = 50.6 GB = 39.5% → admitted.
        let mut fits = LoadRequest::new("org/fits");
        fits.performance_overrides = Some(json!({ "memory_estimate_gb": 44.0 }));
        h.manager.load_model(fits).await.unwrap();

        // 45 GB × 1.15 = 51.75 GB = 40.4% → rejected.
        let mut too_big = LoadRequest::new("org/too-big");
        too_big.performance_overrides = Some(json!({ "memory_estimate_gb": 45.0 }));
        let err = h.manager.load_model(too_big).await.unwrap_err();
        assert_eq!(err.code(), "insufficient_memory");
    }

    #[tokio::test]
    async fn lru_eviction_frees_room_for_new_load() {
        let server = MockServer::start().await;
        mount_healthy_runtime(&server, "OK").await;
        // 128 GB total, threshold 90%, base usage 5%.
        let h = Arc::new(harness(
            &server.uri(),
            MemoryMonitor::fixed(90.0, 128.0, 6.4),
            true,
        ));

        // Simulate OS accounting: fixture usage tracks loads and unloads.
        let mut events = h.bus.subscribe();
        {
            let memory = Arc::clone(&h.memory);
            tokio::spawn(async move {
                let mut used = 6.4;
                loop {
                    let Ok(event) = events.recv().await else { break };
                    match event.event_type.as_str() {
                        "model_loaded" => used += 20.0,
                        "model_unloaded" => used -= 20.0,
                        _ => continue,
                    }
                    memory.set_fixed_usage(128.0, used);
                }
            });
        }

        let mut a = LoadRequest::new("org/a");
        a.performance_overrides = Some(json!({ "memory_estimate_gb": 17.4 })); // ×1.15 ≈ 20 GB
        h.manager.load_model(a).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut b = LoadRequest::new("org/b");
        b.performance_overrides = Some(json!({ "memory_estimate_gb": 17.4 }));
        h.manager.load_model(b).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // C needs ~103.5 GB reserved: only fits once both A and B are gone.
        let mut unload_order = Vec::new();
        let mut events = h.bus.subscribe();
        let mut c = LoadRequest::new("org/c");
        c.performance_overrides = Some(json!({ "memory_estimate_gb": 90.0 }));
        h.manager.load_model(c).await.unwrap();

        while let Ok(event) = events.try_recv() {
            if event.event_type == "model_unloaded" {
                unload_order.push(event.data["model_id"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(unload_order, vec!["org/a", "org/b"]);
        assert!(h.models.contains("org/c"));
        assert!(!h.models.contains("org/a"));
        assert!(!h.models.contains("org/b"));
    }

    // -----------------------------------------------------------------------
    // Canary
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn empty_canary_response_quarantines_and_unloads() {
        let server = MockServer::start().await;
        mount_healthy_runtime(&server, "").await; // canary gets an empty reply
        let h = harness(&server.uri(), MemoryMonitor::fixed(90.0, 128.0, 51.2), false);

        let err = h
            .manager
            .load_model(LoadRequest::new("org/model"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "model_canary_failed");
        assert!(err.to_string().contains("failed canary"));

        // Not in the loaded map, but quarantine survives the unload.
        assert!(!h.models.contains("org/model"));
        let record = h.readiness.get("org/model").expect("readiness retained");
        assert_eq!(record.state, ReadinessState::Quarantined);

        // A failing compatibility row names the canary.
        let rows = h.compatibility.rows(&crate::registry::CompatFilter {
            model_id: Some("org/model".into()),
            outcome: Some(CompatOutcome::Fail),
            ..Default::default()
        });
        assert!(rows.iter().any(|r| r
            .reason
            .as_deref()
            .is_some_and(|reason| reason.contains("canary_failed"))));
    }

    #[tokio::test]
    async fn canary_failure_emits_unload_event_with_reason() {
        let server = MockServer::start().await;
        mount_healthy_runtime(&server, "   ").await; // whitespace-only is empty
        let h = harness(&server.uri(), MemoryMonitor::fixed(90.0, 128.0, 51.2), false);
        let mut events = h.bus.subscribe();

        let _ = h.manager.load_model(LoadRequest::new("org/model")).await;

        let mut saw_unload = false;
        while let Ok(event) = events.try_recv() {
            if event.event_type == "model_unloaded" {
                assert_eq!(event.data["reason"], "canary_failed");
                saw_unload = true;
            }
        }
        assert!(saw_unload);
    }

    // -----------------------------------------------------------------------
    // Unload / TTL
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn unload_clears_readiness_and_publishes_event() {
        let server = MockServer::start().await;
        mount_healthy_runtime(&server, "OK").await;
        let h = harness(&server.uri(), MemoryMonitor::fixed(90.0, 128.0, 51.2), false);

        h.manager.load_model(LoadRequest::new("org/model")).await.unwrap();
        let mut events = h.bus.subscribe();
        h.manager.unload_model("org/model", "manual").await.unwrap();

        assert!(!h.models.contains("org/model"));
        assert!(h.readiness.get("org/model").is_none());

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type, "model_unloaded");
        assert_eq!(event.data["reason"], "manual");
    }

    #[tokio::test]
    async fn unload_of_unknown_model_is_not_found() {
        let server = MockServer::start().await;
        let h = harness(&server.uri(), MemoryMonitor::fixed(90.0, 128.0, 51.2), false);
        let err = h.manager.unload_model("org/ghost", "manual").await.unwrap_err();
        assert_eq!(err.code(), "model_not_found");
    }

    #[tokio::test]
    async fn ttl_eviction_honours_keep_alive_and_pinning() {
        let server = MockServer::start().await;
        mount_healthy_runtime(&server, "OK").await;
        let h = harness(&server.uri(), MemoryMonitor::fixed(90.0, 128.0, 51.2), false);

        let mut short = LoadRequest::new("org/short-ttl");
        short.keep_alive_sec = Some(1);
        h.manager.load_model(short).await.unwrap();

        let mut pinned = LoadRequest::new("org/pinned");
        pinned.keep_alive_sec = Some(0);
        h.manager.load_model(pinned).await.unwrap();

        h.manager.load_model(LoadRequest::new("org/default-ttl")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let evicted = h.manager.evict_idle_models(3600).await;

        assert_eq!(evicted, vec!["org/short-ttl".to_string()]);
        assert!(h.models.contains("org/pinned"));
        assert!(h.models.contains("org/default-ttl"));
    }

    // -----------------------------------------------------------------------
    // Probe
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn probe_reports_reachable_runtime_as_pass() {
        let server = MockServer::start().await;
        mount_healthy_runtime(&server, "OK").await;
        let h = harness(&server.uri(), MemoryMonitor::fixed(90.0, 128.0, 51.2), false);

        let result = h
            .manager
            .probe_model_backends("org/model", 2, false)
            .await
            .unwrap();
        assert_eq!(result.recommended_backend.as_deref(), Some("vllm"));
        assert_eq!(result.candidates.len(), 1);
        assert_eq!(result.candidates[0].outcome, CompatOutcome::Pass);
        // Probing never loads anything.
        assert!(h.models.is_empty());
    }

    #[tokio::test]
    async fn probe_gguf_model_checks_local_snapshot_only() {
        let server = MockServer::start().await;
        let h = harness(&server.uri(), MemoryMonitor::fixed(90.0, 128.0, 51.2), false);

        let result = h
            .manager
            .probe_model_backends("org/model-GGUF", 2, false)
            .await
            .unwrap();
        assert_eq!(result.candidates.len(), 1);
        assert_eq!(result.candidates[0].backend, "gguf");
        assert_eq!(result.candidates[0].outcome, CompatOutcome::Fail);
        assert!(result.recommended_backend.is_none());
    }

    // -----------------------------------------------------------------------
    // Speculative resolution
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn speculative_active_on_vllm_inactive_on_gguf() {
        let server = MockServer::start().await;
        let h = harness(&server.uri(), MemoryMonitor::fixed(90.0, 128.0, 51.2), false);

        let overrides = json!({ "speculative": { "draft_model": "org/draft", "num_tokens": 4 } });
        let on_vllm = h
            .manager
            .resolve_speculative(&overrides, BackendKind::Vllm)
            .unwrap();
        assert!(on_vllm.requested && on_vllm.active);
        assert_eq!(on_vllm.draft_model.as_deref(), Some("org/draft"));
        assert_eq!(on_vllm.num_tokens, Some(4));

        let on_gguf = h
            .manager
            .resolve_speculative(&overrides, BackendKind::Gguf)
            .unwrap();
        assert!(on_gguf.requested && !on_gguf.active);
        assert_eq!(on_gguf.reason.as_deref(), Some("backend_unsupported:gguf"));
    }

    #[tokio::test]
    async fn speculative_require_supported_fails_on_gguf() {
        let server = MockServer::start().await;
        let h = harness(&server.uri(), MemoryMonitor::fixed(90.0, 128.0, 51.2), false);

        let overrides = json!({
            "speculative": { "draft_model": "org/draft", "require_supported": true }
        });
        let err = h
            .manager
            .resolve_speculative(&overrides, BackendKind::Gguf)
            .unwrap_err();
        assert_eq!(err.code(), "not_supported");
    }

    #[tokio::test]
    async fn speculative_not_requested_without_draft_model() {
        let server = MockServer::start().await;
        let h = harness(&server.uri(), MemoryMonitor::fixed(90.0, 128.0, 51.2), false);
        let status = h
            .manager
            .resolve_speculative(&json!({}), BackendKind::Vllm)
            .unwrap();
        assert!(!status.requested);
        assert_eq!(status.reason.as_deref(), Some("not_requested"));
    }
}
