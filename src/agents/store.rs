//! Agent run persistence.
//!
//! Runs are stored as JSON lines, one snapshot per status transition; the
//! latest line for an id wins on load. `compact` rewrites the file to the
//! retained set so the log cannot grow without bound.

use std::{collections::HashMap, io::Write as _, path::PathBuf, sync::Mutex};

use super::types::AgentRun;

pub enum RunStore {
    /// In-process only; dies with the runtime.
    Memory,
    /// JSONL file under the state directory.
    File { path: PathBuf, lock: Mutex<()> },
}

impl RunStore {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn file(path: PathBuf) -> Self {
        Self::File {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Append a snapshot of the run. Persistence failures are logged, never
    /// propagated — a dead disk must not take down run execution.
    pub fn save(&self, run: &AgentRun) {
        let Self::File { path, lock } = self else {
            return;
        };
        let _guard = lock.lock().expect("run store lock poisoned");
        let result = (|| -> anyhow::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            writeln!(file, "{}", serde_json::to_string(run)?)?;
            Ok(())
        })();
        if let Err(error) = result {
            tracing::warn!(run_id = run.id, %error, "run store append failed");
        }
    }

    /// All runs, latest snapshot per id, oldest first by creation time.
    pub fn load_all(&self) -> Vec<AgentRun> {
        let Self::File { path, lock } = self else {
            return Vec::new();
        };
        let _guard = lock.lock().expect("run store lock poisoned");
        let Ok(content) = std::fs::read_to_string(path) else {
            return Vec::new();
        };

        let mut latest: HashMap<String, AgentRun> = HashMap::new();
        for line in content.lines() {
            match serde_json::from_str::<AgentRun>(line) {
                Ok(run) => {
                    latest.insert(run.id.clone(), run);
                }
                Err(error) => {
                    tracing::warn!(%error, "skipping corrupt run store line");
                }
            }
        }

        let mut runs: Vec<AgentRun> = latest.into_values().collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }

    /// Rewrite the file to exactly `runs`, dropping superseded snapshots.
    pub fn compact(&self, runs: &[AgentRun]) {
        let Self::File { path, lock } = self else {
            return;
        };
        let _guard = lock.lock().expect("run store lock poisoned");
        let result = (|| -> anyhow::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut content = String::new();
            for run in runs {
                content.push_str(&serde_json::to_string(run)?);
                content.push('\n');
            }
            let tmp = path.with_extension("jsonl.tmp");
            std::fs::write(&tmp, content)?;
            std::fs::rename(&tmp, path)?;
            Ok(())
        })();
        if let Err(error) = result {
            tracing::warn!(%error, "run store compaction failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::types::{AgentRequest, RunStatus, RunStrategy};

    fn sample_run(prompt: &str) -> AgentRun {
        AgentRun::queued(AgentRequest::new(
            RunStrategy::Handoff,
            prompt,
            vec!["solo".into()],
        ))
    }

    #[test]
    fn memory_store_loads_nothing() {
        let store = RunStore::memory();
        store.save(&sample_run("x"));
        assert!(store.load_all().is_empty());
    }

    #[test]
    fn latest_snapshot_wins_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::file(dir.path().join("runs.jsonl"));

        let mut run = sample_run("x");
        store.save(&run);
        run.status = RunStatus::Running;
        run.touch();
        store.save(&run);
        run.status = RunStatus::Completed;
        run.touch();
        store.save(&run);

        let loaded = store.load_all();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, RunStatus::Completed);
    }

    #[test]
    fn runs_load_in_creation_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::file(dir.path().join("runs.jsonl"));

        let first = sample_run("first");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = sample_run("second");
        // Write newest first to prove ordering comes from created_at.
        store.save(&second);
        store.save(&first);

        let loaded = store.load_all();
        assert_eq!(loaded[0].request.prompt, "first");
        assert_eq!(loaded[1].request.prompt, "second");
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let store = RunStore::file(path.clone());
        store.save(&sample_run("ok"));
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{{broken"))
            .unwrap();

        assert_eq!(store.load_all().len(), 1);
    }

    #[test]
    fn compact_drops_superseded_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let store = RunStore::file(path.clone());

        let mut keep = sample_run("keep");
        store.save(&keep);
        keep.status = RunStatus::Completed;
        store.save(&keep);
        store.save(&sample_run("drop"));

        store.compact(std::slice::from_ref(&keep));

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        let loaded = store.load_all();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].request.prompt, "keep");
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::file(dir.path().join("never-written.jsonl"));
        assert!(store.load_all().is_empty());
    }
}
