//! The engine façade: the one object HTTP handlers talk to.
//!
//! [`InferenceEngine`] owns the loaded-model map, the concurrency controller,
//! and the registries, and composes the lifecycle manager with the generation
//! executor. It is instantiated once at startup and handed to request
//! handlers — never discovered through ambient context. No registry ever
//! calls back into the engine; updates flow one way and surface as events.

use std::{path::PathBuf, sync::Arc, time::Duration};

use dashmap::DashMap;
use serde_json::Value;

use crate::{
    concurrency::ConcurrencyController,
    config::Config,
    error::LmxError,
    events::EventBus,
    memory::MemoryMonitor,
    registry::{
        AutotuneMetrics, AutotuneRecord, AutotuneRegistry, CompatFilter, CompatSummary,
        CompatibilityRegistry, CompatibilityRow, ReadinessRecord, ReadinessTracker,
    },
};

use super::{
    generate::{GenerationExecutor, StreamHandle},
    lifecycle::{LoadRequest, LoadedModels, ModelLifecycleManager, ProbeResult},
    types::{CompletionResult, GenerateParams, ModelInfo, RequestTelemetry},
};

/// Tracks model access recency/frequency to rank prefetch suggestions.
#[derive(Default)]
struct AccessPredictor {
    accesses: DashMap<String, AccessStats>,
}

#[derive(Clone, Copy, Default)]
struct AccessStats {
    count: u64,
    last_access_ms: u64,
}

impl AccessPredictor {
    fn record(&self, model_id: &str) {
        let now = chrono::Utc::now().timestamp_millis() as u64;
        let mut stats = self.accesses.entry(model_id.to_string()).or_default();
        stats.count += 1;
        stats.last_access_ms = now;
    }

    /// Models ranked by access count then recency.
    fn ranked(&self) -> Vec<String> {
        let mut all: Vec<(String, AccessStats)> = self
            .accesses
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        all.sort_by(|a, b| {
            b.1.count
                .cmp(&a.1.count)
                .then(b.1.last_access_ms.cmp(&a.1.last_access_ms))
        });
        all.into_iter().map(|(id, _)| id).collect()
    }
}

pub struct InferenceEngine {
    models: Arc<LoadedModels>,
    readiness: Arc<ReadinessTracker>,
    compatibility: Arc<CompatibilityRegistry>,
    autotune: Arc<AutotuneRegistry>,
    memory: Arc<MemoryMonitor>,
    concurrency: Arc<ConcurrencyController>,
    lifecycle: ModelLifecycleManager,
    executor: GenerationExecutor,
    predictor: AccessPredictor,
}

impl InferenceEngine {
    /// Assemble the full control plane from config. `state_dir` receives the
    /// compatibility log and autotune records.
    pub fn new(config: &Config, state_dir: PathBuf, bus: EventBus) -> Self {
        let memory = Arc::new(MemoryMonitor::new(config.memory.threshold_percent));
        let compatibility = Arc::new(CompatibilityRegistry::with_log_file(
            4096,
            state_dir.join("compatibility.jsonl"),
        ));
        let autotune = Arc::new(AutotuneRegistry::with_file(state_dir.join("autotune.json")));
        Self::assemble(config, state_dir, bus, memory, compatibility, autotune)
    }

    /// Assembly seam used by tests to inject a fixed memory monitor and
    /// memory-only registries.
    pub fn assemble(
        config: &Config,
        state_dir: PathBuf,
        bus: EventBus,
        memory: Arc<MemoryMonitor>,
        compatibility: Arc<CompatibilityRegistry>,
        autotune: Arc<AutotuneRegistry>,
    ) -> Self {
        let models = Arc::new(LoadedModels::default());
        let readiness = Arc::new(ReadinessTracker::new(bus.clone()));
        let concurrency = Arc::new(ConcurrencyController::new(&config.concurrency));

        let cache_dir = config
            .downloads
            .cache_dir
            .clone()
            .unwrap_or_else(|| state_dir.join("models"));

        let lifecycle = ModelLifecycleManager::new(
            Arc::clone(&models),
            Arc::clone(&readiness),
            Arc::clone(&compatibility),
            Arc::clone(&autotune),
            Arc::clone(&memory),
            Arc::clone(&concurrency),
            bus.clone(),
            config.models.clone(),
            config.inference.clone(),
            config.speculative.clone(),
            cache_dir,
        );

        let executor = GenerationExecutor::new(
            Arc::clone(&models),
            Arc::clone(&readiness),
            Arc::clone(&concurrency),
            Arc::clone(&memory),
            Duration::from_secs(config.inference.timeout_sec),
            config.inference.quarantine_threshold,
        );

        Self {
            models,
            readiness,
            compatibility,
            autotune,
            memory,
            concurrency,
            lifecycle,
            executor,
            predictor: AccessPredictor::default(),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    pub async fn load_model(&self, request: LoadRequest) -> Result<ModelInfo, LmxError> {
        self.lifecycle.load_model(request).await
    }

    pub async fn unload_model(&self, model_id: &str, reason: &str) -> Result<f64, LmxError> {
        self.lifecycle.unload_model(model_id, reason).await
    }

    pub async fn evict_idle_models(&self, default_ttl_sec: u64) -> Vec<String> {
        self.lifecycle.evict_idle_models(default_ttl_sec).await
    }

    pub async fn probe_model_backends(
        &self,
        model_id: &str,
        timeout_sec: u64,
        allow_unsupported_runtime: bool,
    ) -> Result<ProbeResult, LmxError> {
        self.lifecycle
            .probe_model_backends(model_id, timeout_sec, allow_unsupported_runtime)
            .await
    }

    // ── Request path ────────────────────────────────────────────────────

    pub async fn generate(
        &self,
        params: GenerateParams,
    ) -> Result<(CompletionResult, RequestTelemetry), LmxError> {
        self.predictor.record(&params.model_id);
        self.executor.generate(params).await
    }

    pub async fn stream_generate(&self, params: GenerateParams) -> Result<StreamHandle, LmxError> {
        self.predictor.record(&params.model_id);
        self.executor.stream_generate(params).await
    }

    // ── Drain ───────────────────────────────────────────────────────────

    /// Wait until no request is in flight. Returns `false` on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let mut rx = self.concurrency.idle_watch();
        if *rx.borrow() {
            return true;
        }
        tokio::time::timeout(timeout, async {
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn get_loaded_models(&self) -> Vec<ModelInfo> {
        self.models
            .snapshot()
            .iter()
            .map(|m| ModelInfo::from_loaded(m))
            .collect()
    }

    pub fn is_model_loaded(&self, model_id: &str) -> bool {
        self.models.contains(model_id)
    }

    pub fn model_readiness(&self, model_id: &str) -> Option<ReadinessRecord> {
        self.readiness.get(model_id)
    }

    pub fn readiness_snapshot(&self) -> std::collections::HashMap<String, ReadinessRecord> {
        self.readiness.snapshot()
    }

    pub fn compatibility_rows(&self, filter: &CompatFilter) -> Vec<CompatibilityRow> {
        self.compatibility.rows(filter)
    }

    pub fn compatibility_summary(&self) -> std::collections::HashMap<String, CompatSummary> {
        self.compatibility.summary_by_model()
    }

    /// The best tuned profile for `(model, backend)` across known versions.
    pub fn get_tuned_profile(&self, model_id: &str, backend: &str) -> Option<AutotuneRecord> {
        self.autotune
            .snapshot()
            .into_iter()
            .filter(|r| r.model_id == model_id && r.backend == backend)
            .min_by(|a, b| a.score.partial_cmp(&b.score).expect("scores are finite"))
    }

    pub fn save_tuned_profile(
        &self,
        model_id: &str,
        backend: &str,
        backend_version: &str,
        profile: Value,
        metrics: AutotuneMetrics,
        force: bool,
    ) -> AutotuneRecord {
        self.autotune
            .save(model_id, backend, backend_version, profile, metrics, force)
    }

    /// Frequently used models that are not currently loaded, best first.
    pub fn suggest_prefetch_models(&self, limit: usize) -> Vec<String> {
        self.predictor
            .ranked()
            .into_iter()
            .filter(|id| !self.models.contains(id))
            .take(limit)
            .collect()
    }

    pub fn adapt_concurrency(&self) -> usize {
        self.concurrency.adapt(&self.memory)
    }

    pub fn in_flight_count(&self) -> usize {
        self.concurrency.in_flight_count()
    }

    pub fn waiting_queue_count(&self) -> usize {
        self.concurrency.waiting_queue_count()
    }

    pub fn current_concurrency_limit(&self) -> usize {
        self.concurrency.current_limit()
    }

    pub fn last_adapt_reason(&self) -> String {
        self.concurrency.last_adapt_reason()
    }

    pub fn memory(&self) -> &MemoryMonitor {
        &self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{concurrency::Priority, registry::ReadinessState};
    use serde_json::json;

    fn engine() -> InferenceEngine {
        let config = Config::default();
        InferenceEngine::assemble(
            &config,
            std::env::temp_dir().join("opta-lmx-engine-tests"),
            EventBus::new(16),
            Arc::new(MemoryMonitor::fixed(90.0, 128.0, 51.2)),
            Arc::new(CompatibilityRegistry::new(64)),
            Arc::new(AutotuneRegistry::new()),
        )
    }

    #[tokio::test]
    async fn drain_returns_immediately_when_idle() {
        let engine = engine();
        assert!(engine.drain(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn drain_times_out_while_a_request_is_in_flight() {
        let engine = engine();
        let guard = engine
            .concurrency
            .acquire("org/m", Priority::Normal, None)
            .await
            .unwrap();
        assert!(!engine.drain(Duration::from_millis(50)).await);
        drop(guard);
        assert!(engine.drain(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn generate_on_unknown_model_fails_but_feeds_predictor() {
        let engine = engine();
        for _ in 0..3 {
            let _ = engine
                .generate(GenerateParams::new(
                    "org/popular",
                    vec![crate::inference::ChatMessage::user("hi")],
                ))
                .await;
        }
        let _ = engine
            .generate(GenerateParams::new(
                "org/rare",
                vec![crate::inference::ChatMessage::user("hi")],
            ))
            .await;

        let suggestions = engine.suggest_prefetch_models(2);
        assert_eq!(suggestions[0], "org/popular");
        assert_eq!(suggestions[1], "org/rare");
    }

    #[test]
    fn tuned_profile_lookup_spans_versions() {
        let engine = engine();
        engine.save_tuned_profile(
            "org/m",
            "vllm",
            "0.8",
            json!({"kv_bits": 8}),
            AutotuneMetrics {
                tokens_per_sec: 40.0,
                ..Default::default()
            },
            false,
        );
        engine.save_tuned_profile(
            "org/m",
            "vllm",
            "0.9",
            json!({"kv_bits": 4}),
            AutotuneMetrics {
                tokens_per_sec: 120.0,
                ..Default::default()
            },
            false,
        );

        let best = engine.get_tuned_profile("org/m", "vllm").unwrap();
        assert_eq!(best.profile, json!({"kv_bits": 4}));
        assert!(engine.get_tuned_profile("org/m", "gguf").is_none());
    }

    #[test]
    fn readiness_queries_reflect_tracker_state() {
        let engine = engine();
        engine
            .readiness
            .set_state("org/m", ReadinessState::Loading, None);
        assert_eq!(
            engine.model_readiness("org/m").unwrap().state,
            ReadinessState::Loading
        );
        assert_eq!(engine.readiness_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn adapt_concurrency_is_exposed() {
        let engine = engine();
        let target = engine.adapt_concurrency();
        assert_eq!(target, engine.current_concurrency_limit());
    }
}
