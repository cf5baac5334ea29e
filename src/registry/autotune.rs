//! Autotune registry: best-known performance profile per model/backend.
//!
//! Each `(model_id, backend, backend_version)` key maps to the profile that
//! scored best in an autotune sweep, together with the metrics it was scored
//! on. The lifecycle manager applies the stored profile at load time, with
//! explicit performance overrides winning per key.
//!
//! Records are persisted as one keyed JSON document, rewritten on every save.

use std::{collections::HashMap, path::PathBuf, sync::Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metrics an autotune trial is scored on.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AutotuneMetrics {
    pub tokens_per_sec: f64,
    pub ttft_sec: f64,
    pub error_rate: f64,
    pub total_latency_sec: f64,
    pub queue_wait_sec: f64,
}

impl AutotuneMetrics {
    /// Deterministic sort key; lower is better.
    ///
    /// Throughput contributes inversely so faster trials score lower; the
    /// remaining terms are straight penalties. Error rate dominates: a trial
    /// that errors is effectively disqualified against any clean one.
    pub fn score(&self) -> f64 {
        let throughput_penalty = if self.tokens_per_sec > 0.0 {
            1000.0 / self.tokens_per_sec
        } else {
            1000.0
        };
        throughput_penalty
            + self.ttft_sec * 10.0
            + self.error_rate * 10_000.0
            + self.total_latency_sec
            + self.queue_wait_sec * 5.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutotuneRecord {
    pub model_id: String,
    pub backend: String,
    pub backend_version: String,
    pub profile: Value,
    pub metrics: AutotuneMetrics,
    pub score: f64,
    pub updated_at: DateTime<Utc>,
}

pub struct AutotuneRegistry {
    records: Mutex<HashMap<String, AutotuneRecord>>,
    path: Option<PathBuf>,
}

impl AutotuneRegistry {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            path: None,
        }
    }

    /// Registry backed by a keyed JSON file, loaded immediately. A missing
    /// or unreadable file yields an empty registry.
    pub fn with_file(path: PathBuf) -> Self {
        let records = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str::<HashMap<String, AutotuneRecord>>(&content).ok())
            .unwrap_or_default();
        Self {
            records: Mutex::new(records),
            path: Some(path),
        }
    }

    fn key(model_id: &str, backend: &str, backend_version: &str) -> String {
        format!("{model_id}::{backend}::{backend_version}")
    }

    /// Store `profile` if it beats the existing record's score (or `force`).
    /// Returns the record now held for the key.
    pub fn save(
        &self,
        model_id: &str,
        backend: &str,
        backend_version: &str,
        profile: Value,
        metrics: AutotuneMetrics,
        force: bool,
    ) -> AutotuneRecord {
        let key = Self::key(model_id, backend, backend_version);
        let score = metrics.score();
        let record = {
            let mut records = self.records.lock().expect("autotune lock poisoned");
            let keep_existing = records
                .get(&key)
                .is_some_and(|existing| !force && existing.score <= score);
            if !keep_existing {
                records.insert(
                    key.clone(),
                    AutotuneRecord {
                        model_id: model_id.to_string(),
                        backend: backend.to_string(),
                        backend_version: backend_version.to_string(),
                        profile,
                        metrics,
                        score,
                        updated_at: Utc::now(),
                    },
                );
            }
            records.get(&key).cloned().expect("record just ensured")
        };
        self.persist();
        record
    }

    pub fn get(&self, model_id: &str, backend: &str, backend_version: &str) -> Option<AutotuneRecord> {
        self.records
            .lock()
            .expect("autotune lock poisoned")
            .get(&Self::key(model_id, backend, backend_version))
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<AutotuneRecord> {
        let records = self.records.lock().expect("autotune lock poisoned");
        let mut all: Vec<_> = records.values().cloned().collect();
        all.sort_by(|a, b| a.model_id.cmp(&b.model_id).then(a.backend.cmp(&b.backend)));
        all
    }

    fn persist(&self) {
        let Some(path) = &self.path else { return };
        let records = self.records.lock().expect("autotune lock poisoned");
        let result = (|| -> anyhow::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let content = serde_json::to_string_pretty(&*records)?;
            std::fs::write(path, content)?;
            Ok(())
        })();
        if let Err(error) = result {
            tracing::warn!(path = %path.display(), %error, "autotune persist failed");
        }
    }
}

impl Default for AutotuneRegistry {
    fn default() -> Self {
        Self::new()
    }
}
