//! Configuration types for opta-lmx.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults.
//!
//! # Example
//! ```toml
//! [server]
//! client_port = 1234
//!
//! [memory]
//! threshold_percent = 90.0
//!
//! [concurrency]
//! max_concurrent_requests = 4
//!
//! [models]
//! backend_preferences = ["vllm", "mlx-lm"]
//! gguf_fallback = true
//!
//! [models.runtimes.vllm]
//! command = "vllm serve {model} --port {port}"
//! ```

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// The kind of runtime backend a model can be served by.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// OpenAI-compatible high-throughput runtime server.
    Vllm,
    /// OpenAI-compatible lightweight runtime server.
    MlxLm,
    /// llama.cpp-style server speaking its native `/completion` protocol.
    Gguf,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vllm => "vllm",
            Self::MlxLm => "mlx-lm",
            Self::Gguf => "gguf",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "vllm" => Some(Self::Vllm),
            "mlx-lm" => Some(Self::MlxLm),
            "gguf" => Some(Self::Gguf),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    #[serde(default)]
    pub models: ModelsConfig,

    #[serde(default)]
    pub inference: InferenceConfig,

    #[serde(default)]
    pub speculative: SpeculativeConfig,

    #[serde(default)]
    pub agents: AgentsConfig,

    #[serde(default)]
    pub downloads: DownloadsConfig,

    #[serde(default)]
    pub state: StateConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.concurrency.max_concurrent_requests >= 1,
            "concurrency.max_concurrent_requests must be at least 1"
        );
        anyhow::ensure!(
            self.concurrency.min_concurrent >= 1
                && self.concurrency.min_concurrent <= self.concurrency.max_concurrent_requests,
            "concurrency.min_concurrent must be in [1, max_concurrent_requests]"
        );

        // Per-model caps must be strictly below the global ceiling, otherwise
        // they would never constrain anything.
        for (model_id, limit) in &self.concurrency.per_model_limits {
            anyhow::ensure!(
                *limit >= 1 && *limit < self.concurrency.max_concurrent_requests,
                "concurrency.per_model_limits[\"{}\"] = {} must be in [1, {})",
                model_id,
                limit,
                self.concurrency.max_concurrent_requests
            );
        }

        for pref in &self.models.backend_preferences {
            anyhow::ensure!(
                BackendKind::parse(pref).is_some(),
                "models.backend_preferences contains unknown backend kind `{pref}`"
            );
        }

        anyhow::ensure!(
            self.memory.threshold_percent > 0.0 && self.memory.threshold_percent <= 100.0,
            "memory.threshold_percent must be in (0, 100]"
        );

        anyhow::ensure!(
            self.agents.queue_capacity >= 1,
            "agents.queue_capacity must be at least 1"
        );
        anyhow::ensure!(
            self.agents.max_steps_per_run >= 1,
            "agents.max_steps_per_run must be at least 1"
        );

        Ok(())
    }

    /// Ordered backend preferences parsed into kinds. Validation guarantees
    /// every entry parses.
    pub fn backend_preferences(&self) -> Vec<BackendKind> {
        self.models
            .backend_preferences
            .iter()
            .filter_map(|s| BackendKind::parse(s))
            .collect()
    }

    /// Directory for all persisted state, creating nothing.
    pub fn state_dir(&self) -> PathBuf {
        self.state.dir.clone().unwrap_or_else(default_state_dir)
    }
}

/// Listener settings. The admin port is separate so it can be
/// network-restricted independently of the client API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "defaults::client_port")]
    pub client_port: u16,

    #[serde(default = "defaults::admin_port")]
    pub admin_port: u16,

    /// Log level override (also controlled by `RUST_LOG` env var).
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty server config must deserialize")
    }
}

/// Memory admission settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryConfig {
    /// System memory usage percent above which loads are refused.
    #[serde(default = "defaults::threshold_percent")]
    pub threshold_percent: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty memory config must deserialize")
    }
}

/// Concurrency controller settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConcurrencyConfig {
    /// Ceiling for the adaptive global limit.
    #[serde(default = "defaults::max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Floor for the adaptive global limit.
    #[serde(default = "defaults::min_concurrent")]
    pub min_concurrent: usize,

    /// Seconds a request may wait for a slot before failing busy.
    #[serde(default = "defaults::semaphore_timeout_sec")]
    pub semaphore_timeout_sec: f64,

    /// Enables the latency overlay on top of the memory-pressure baseline.
    #[serde(default = "defaults::adaptive_enabled")]
    pub adaptive_enabled: bool,

    /// Rolling-p95 latency target in milliseconds.
    #[serde(default = "defaults::latency_target_ms")]
    pub latency_target_ms: f64,

    /// Number of latency samples retained for p95 computation.
    #[serde(default = "defaults::latency_window")]
    pub latency_window: usize,

    /// Explicit per-model caps; each must be `< max_concurrent_requests`.
    #[serde(default)]
    pub per_model_limits: HashMap<String, usize>,

    /// Default per-client cap. Unset means unlimited per client.
    #[serde(default)]
    pub per_client_default: Option<usize>,

    /// Per-client overrides keyed by client identity.
    #[serde(default)]
    pub per_client_overrides: HashMap<String, usize>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty concurrency config must deserialize")
    }
}

/// Model lifecycle settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelsConfig {
    /// Ordered backend candidates tried for non-gguf models.
    #[serde(default = "defaults::backend_preferences")]
    pub backend_preferences: Vec<String>,

    /// Append `gguf` to the candidate list for non-gguf models.
    #[serde(default = "defaults::gguf_fallback")]
    pub gguf_fallback: bool,

    /// Evict the least-recently-used model when admission fails.
    #[serde(default = "defaults::auto_evict_lru")]
    pub auto_evict_lru: bool,

    /// TTL applied by the idle-eviction loop when a model has no
    /// `keep_alive_sec` of its own. `0` disables the loop entirely.
    #[serde(default = "defaults::default_keep_alive_sec")]
    pub default_keep_alive_sec: u64,

    /// Pass batching hints to backends that accept them.
    #[serde(default)]
    pub use_batching: bool,

    /// Per-backend runtime launch settings.
    #[serde(default)]
    pub runtimes: HashMap<String, RuntimeConfig>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty models config must deserialize")
    }
}

/// How to reach (or launch) one backend runtime.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Launch command template; `{model}` and `{port}` are substituted.
    /// Unset means this backend can only attach.
    #[serde(default)]
    pub command: Option<String>,

    /// Attach to an externally managed server instead of spawning one.
    #[serde(default)]
    pub base_url: Option<String>,

    /// First port assigned to spawned servers; successive loads increment.
    #[serde(default = "defaults::runtime_port_base")]
    pub port_base: u16,
}

/// Request-path settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InferenceConfig {
    /// Hard ceiling on a single backend generate/stream call.
    #[serde(default = "defaults::inference_timeout_sec")]
    pub timeout_sec: u64,

    /// Run the out-of-process loader probe before vllm construction.
    #[serde(default = "defaults::loader_isolation")]
    pub loader_isolation: bool,

    /// Ceiling on loader probe and runtime bring-up.
    #[serde(default = "defaults::loader_timeout_sec")]
    pub loader_timeout_sec: u64,

    /// Failures before a model is quarantined.
    #[serde(default = "defaults::quarantine_threshold")]
    pub quarantine_threshold: u32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty inference config must deserialize")
    }
}

/// Server-wide speculative-decoding defaults; per-load overrides win.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SpeculativeConfig {
    #[serde(default)]
    pub draft_model: Option<String>,

    #[serde(default)]
    pub num_tokens: Option<u32>,

    /// Raise instead of warn when a backend cannot honour speculative config.
    #[serde(default)]
    pub require_supported: bool,
}

/// Agent runtime settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentsConfig {
    #[serde(default = "defaults::max_steps_per_run")]
    pub max_steps_per_run: usize,

    #[serde(default = "defaults::queue_capacity")]
    pub queue_capacity: usize,

    /// Applied when a request does not set its own timeout.
    #[serde(default = "defaults::agent_timeout_sec")]
    pub default_timeout_sec: u64,

    /// Additional attempts after the first failure of a step.
    #[serde(default = "defaults::step_retry_attempts")]
    pub step_retry_attempts: u32,

    #[serde(default = "defaults::step_retry_backoff_sec")]
    pub step_retry_backoff_sec: f64,

    /// Completed/failed/cancelled runs retained in memory and on disk.
    #[serde(default = "defaults::retain_completed_runs")]
    pub retain_completed_runs: usize,

    /// `memory` keeps runs only in-process; `file` adds the JSONL store.
    #[serde(default = "defaults::agent_store_backend")]
    pub store_backend: String,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty agents config must deserialize")
    }
}

/// Download coordinator settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownloadsConfig {
    /// Refuse downloads when free disk would drop below this floor.
    #[serde(default = "defaults::min_free_disk_gb")]
    pub min_free_disk_gb: f64,

    /// Model cache directory; defaults to `<state.dir>/models`.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty downloads config must deserialize")
    }
}

/// Persisted-state location.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StateConfig {
    /// Defaults to `~/.opta-lmx`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_state_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".opta-lmx")
}

mod defaults {
    pub fn client_port() -> u16 { 1234 }
    pub fn admin_port() -> u16 { 1235 }
    pub fn threshold_percent() -> f64 { 90.0 }
    pub fn max_concurrent_requests() -> usize { 4 }
    pub fn min_concurrent() -> usize { 1 }
    pub fn semaphore_timeout_sec() -> f64 { 30.0 }
    pub fn adaptive_enabled() -> bool { true }
    pub fn latency_target_ms() -> f64 { 2500.0 }
    pub fn latency_window() -> usize { 128 }
    pub fn backend_preferences() -> Vec<String> { vec!["vllm".into(), "mlx-lm".into()] }
    pub fn gguf_fallback() -> bool { true }
    pub fn auto_evict_lru() -> bool { true }
    pub fn default_keep_alive_sec() -> u64 { 300 }
    pub fn runtime_port_base() -> u16 { 8300 }
    pub fn inference_timeout_sec() -> u64 { 120 }
    pub fn loader_isolation() -> bool { true }
    pub fn loader_timeout_sec() -> u64 { 120 }
    pub fn quarantine_threshold() -> u32 { 3 }
    pub fn max_steps_per_run() -> usize { 8 }
    pub fn queue_capacity() -> usize { 32 }
    pub fn agent_timeout_sec() -> u64 { 300 }
    pub fn step_retry_attempts() -> u32 { 2 }
    pub fn step_retry_backoff_sec() -> f64 { 1.0 }
    pub fn retain_completed_runs() -> usize { 256 }
    pub fn agent_store_backend() -> String { "file".into() }
    pub fn min_free_disk_gb() -> f64 { 5.0 }
}
