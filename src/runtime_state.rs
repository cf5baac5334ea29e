//! Runtime state snapshot and crash-loop detection.
//!
//! A small JSON file under the state directory records the loaded model set,
//! whether the last shutdown was clean, and recent process start times. It is
//! rewritten every ten seconds while serving and once more on clean shutdown.
//! On startup the previous snapshot drives two decisions: whether to restore
//! models after an unclean shutdown, and whether the process is crash-looping
//! (three fast restarts) and should skip auto-loading entirely.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Interval at which the serving loop rewrites the snapshot.
pub const SNAPSHOT_INTERVAL_SEC: u64 = 10;

/// Restarts within this window count toward crash-loop detection.
const CRASH_LOOP_WINDOW_SEC: i64 = 120;

/// Fast restarts (including the current one) that trigger safe mode.
const CRASH_LOOP_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    #[serde(default)]
    pub loaded_models: Vec<String>,
    #[serde(default = "default_clean")]
    pub last_clean_shutdown: bool,
    #[serde(default)]
    pub start_times: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_clean() -> bool {
    true
}

/// Handle to the snapshot file plus the startup decisions derived from it.
pub struct RuntimeStateFile {
    path: PathBuf,
    start_times: Vec<DateTime<Utc>>,
    previous: RuntimeSnapshot,
    crash_loop: bool,
}

impl RuntimeStateFile {
    /// Read the previous snapshot, record this start, and persist an initial
    /// unclean snapshot so a crash before the first interval is detectable.
    pub fn startup(path: PathBuf) -> Self {
        let previous: RuntimeSnapshot = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();

        let now = Utc::now();
        let window_start = now - chrono::Duration::seconds(CRASH_LOOP_WINDOW_SEC);
        let mut start_times: Vec<DateTime<Utc>> = previous
            .start_times
            .iter()
            .copied()
            .filter(|t| *t >= window_start)
            .collect();
        start_times.push(now);
        // Only a bounded tail is retained.
        if start_times.len() > 8 {
            let excess = start_times.len() - 8;
            start_times.drain(..excess);
        }

        let crash_loop =
            !previous.last_clean_shutdown && start_times.len() >= CRASH_LOOP_THRESHOLD;

        let state = Self {
            path,
            start_times,
            previous,
            crash_loop,
        };
        state.write(Vec::new(), false);
        state
    }

    /// Whether the process is restarting too fast to trust auto-load.
    pub fn is_crash_loop(&self) -> bool {
        self.crash_loop
    }

    /// The previous run's snapshot (for unclean-shutdown restore).
    pub fn previous(&self) -> &RuntimeSnapshot {
        &self.previous
    }

    /// Models to restore: only after an unclean shutdown, and never in a
    /// crash loop.
    pub fn models_to_restore(&self) -> Vec<String> {
        if self.crash_loop || self.previous.last_clean_shutdown {
            return Vec::new();
        }
        self.previous.loaded_models.clone()
    }

    /// Rewrite the snapshot. Failures are logged, never propagated.
    pub fn write(&self, loaded_models: Vec<String>, clean_shutdown: bool) {
        let snapshot = RuntimeSnapshot {
            loaded_models,
            last_clean_shutdown: clean_shutdown,
            start_times: self.start_times.clone(),
            updated_at: Some(Utc::now()),
        };
        let result = (|| -> anyhow::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = self.path.with_extension("json.tmp");
            std::fs::write(&tmp, serde_json::to_string_pretty(&snapshot)?)?;
            std::fs::rename(&tmp, &self.path)?;
            Ok(())
        })();
        if let Err(error) = result {
            tracing::warn!(path = %self.path.display(), %error, "runtime state write failed");
        }
    }
}
