//! Model/backend compatibility registry.
//!
//! An append-only, bounded log of `(model, backend, version, outcome)` rows.
//! Like the traffic ring-buffer this grew out of, the in-memory window is a
//! fixed-capacity `VecDeque`: once full, the oldest row is evicted. Rows are
//! also appended to a JSON-lines file under the state directory so outcome
//! history survives restarts; the file is replayed (tail only) at startup.
//!
//! The backend policy consumes [`CompatibilityRegistry::latest_outcome`] to
//! skip the most recently failed backend per model.

use std::{
    collections::{HashMap, VecDeque},
    io::Write as _,
    path::PathBuf,
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of one load/canary/probe attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatOutcome {
    Pass,
    Fail,
    Unknown,
}

impl CompatOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Unknown => "unknown",
        }
    }
}

/// One appended row. Rows are never edited in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompatibilityRow {
    pub model_id: String,
    pub backend: String,
    pub backend_version: String,
    pub outcome: CompatOutcome,
    pub reason: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    pub ts: DateTime<Utc>,
}

/// Per-model pass/fail/unknown counts.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CompatSummary {
    pub pass: usize,
    pub fail: usize,
    pub unknown: usize,
}

/// Filter for [`CompatibilityRegistry::rows`].
#[derive(Debug, Clone, Default)]
pub struct CompatFilter {
    pub model_id: Option<String>,
    pub backend: Option<String>,
    pub outcome: Option<CompatOutcome>,
    pub since: Option<DateTime<Utc>>,
}

pub struct CompatibilityRegistry {
    capacity: usize,
    rows: Mutex<VecDeque<CompatibilityRow>>,
    /// Append target; `None` keeps the registry memory-only (tests).
    log_path: Option<PathBuf>,
}

impl CompatibilityRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rows: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            log_path: None,
        }
    }

    /// Registry backed by a JSONL file. Existing rows are replayed into the
    /// in-memory window (most recent `capacity` survive). Unreadable lines
    /// are skipped, not fatal.
    pub fn with_log_file(capacity: usize, path: PathBuf) -> Self {
        let registry = Self {
            capacity: capacity.max(1),
            rows: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            log_path: Some(path.clone()),
        };
        if let Ok(content) = std::fs::read_to_string(&path) {
            let mut rows = registry.rows.lock().expect("compat lock poisoned");
            for line in content.lines() {
                if let Ok(row) = serde_json::from_str::<CompatibilityRow>(line) {
                    if rows.len() == registry.capacity {
                        rows.pop_front();
                    }
                    rows.push_back(row);
                }
            }
        }
        registry
    }

    /// Append one row, evicting the oldest if the window is full.
    pub fn record(
        &self,
        model_id: &str,
        backend: &str,
        backend_version: &str,
        outcome: CompatOutcome,
        reason: Option<&str>,
        metadata: Option<Value>,
    ) -> CompatibilityRow {
        let row = CompatibilityRow {
            model_id: model_id.to_string(),
            backend: backend.to_string(),
            backend_version: backend_version.to_string(),
            outcome,
            reason: reason.map(str::to_string),
            metadata,
            ts: Utc::now(),
        };

        {
            let mut rows = self.rows.lock().expect("compat lock poisoned");
            if rows.len() == self.capacity {
                rows.pop_front();
            }
            rows.push_back(row.clone());
        }

        if let Some(path) = &self.log_path {
            if let Err(error) = append_jsonl(path, &row) {
                tracing::warn!(path = %path.display(), %error, "compatibility log append failed");
            }
        }

        row
    }

    /// Rows matching the filter, oldest first.
    pub fn rows(&self, filter: &CompatFilter) -> Vec<CompatibilityRow> {
        let rows = self.rows.lock().expect("compat lock poisoned");
        rows.iter()
            .filter(|row| {
                filter
                    .model_id
                    .as_deref()
                    .is_none_or(|m| row.model_id == m)
                    && filter.backend.as_deref().is_none_or(|b| row.backend == b)
                    && filter.outcome.is_none_or(|o| row.outcome == o)
                    && filter.since.is_none_or(|since| row.ts >= since)
            })
            .cloned()
            .collect()
    }

    /// The outcome of the most recent row for `(model, backend)`, if any.
    pub fn latest_outcome(&self, model_id: &str, backend: &str) -> Option<CompatOutcome> {
        let rows = self.rows.lock().expect("compat lock poisoned");
        rows.iter()
            .rev()
            .find(|row| row.model_id == model_id && row.backend == backend)
            .map(|row| row.outcome)
    }

    /// `{pass, fail, unknown}` counts per model over the retained window.
    pub fn summary_by_model(&self) -> HashMap<String, CompatSummary> {
        let rows = self.rows.lock().expect("compat lock poisoned");
        let mut summary: HashMap<String, CompatSummary> = HashMap::new();
        for row in rows.iter() {
            let entry = summary.entry(row.model_id.clone()).or_default();
            match row.outcome {
                CompatOutcome::Pass => entry.pass += 1,
                CompatOutcome::Fail => entry.fail += 1,
                CompatOutcome::Unknown => entry.unknown += 1,
            }
        }
        summary
    }

    pub fn len(&self) -> usize {
        self.rows.lock().expect("compat lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn append_jsonl(path: &PathBuf, row: &CompatibilityRow) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let line = serde_json::to_string(row)?;
    writeln!(file, "{line}")?;
    Ok(())
}
