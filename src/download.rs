//! Model download coordination.
//!
//! The coordinator dedupes concurrent downloads of the same snapshot, tracks
//! progress in [`DownloadTask`] records, enforces a free-disk floor, and reaps
//! terminal tasks after a retention window. The actual fetch lives behind the
//! [`Fetcher`] trait — the production implementation shells out to the `hf`
//! CLI; tests inject a scripted one.
//!
//! It also owns the pre-load readiness guards: where a model's files live on
//! disk and whether a snapshot is complete enough to hand to the engine.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::LmxError;

/// How long a terminal task remains queryable before it is reaped.
const TERMINAL_RETENTION: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Downloading,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub download_id: String,
    pub repo_id: String,
    pub status: DownloadStatus,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub progress_percent: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Progress callback: `(downloaded_bytes, total_bytes)`.
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Fetch implementation seam. Downloads `repo_id` into `dest`.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        repo_id: &str,
        revision: Option<&str>,
        dest: &Path,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Production fetcher: shells out to `hf download` and reports coarse
/// progress by polling the destination directory size.
pub struct CliFetcher;

#[async_trait]
impl Fetcher for CliFetcher {
    async fn fetch(
        &self,
        repo_id: &str,
        revision: Option<&str>,
        dest: &Path,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut command = tokio::process::Command::new("hf");
        command
            .arg("download")
            .arg(repo_id)
            .arg("--local-dir")
            .arg(dest);
        if let Some(revision) = revision {
            command.arg("--revision").arg(revision);
        }
        let mut child = command
            .kill_on_drop(true)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;

        let mut poll = tokio::time::interval(Duration::from_millis(500));
        loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status?;
                    anyhow::ensure!(status.success(), "hf download exited with {status}");
                    progress(dir_size(dest), None);
                    return Ok(());
                }
                _ = poll.tick() => {
                    progress(dir_size(dest), None);
                }
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    anyhow::bail!("download cancelled");
                }
            }
        }
    }
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            if meta.is_dir() {
                Some(dir_size(&entry.path()))
            } else {
                Some(meta.len())
            }
        })
        .sum()
}

pub struct DownloadCoordinator {
    cache_dir: PathBuf,
    min_free_disk_gb: f64,
    fetcher: Arc<dyn Fetcher>,
    tasks: Arc<DashMap<String, DownloadTask>>,
    /// `(repo, revision, allow, ignore)` fingerprint → live download id.
    active_by_key: Arc<DashMap<String, String>>,
    cancel: CancellationToken,
    free_disk_probe: Box<dyn Fn(&Path) -> f64 + Send + Sync>,
}

impl DownloadCoordinator {
    pub fn new(cache_dir: PathBuf, min_free_disk_gb: f64, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            cache_dir,
            min_free_disk_gb,
            fetcher,
            tasks: Arc::new(DashMap::new()),
            active_by_key: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
            free_disk_probe: Box::new(free_disk_gb),
        }
    }

    /// Replace the free-disk probe (deterministic disk-floor tests).
    pub fn with_free_disk_probe(
        mut self,
        probe: impl Fn(&Path) -> f64 + Send + Sync + 'static,
    ) -> Self {
        self.free_disk_probe = Box::new(probe);
        self
    }

    /// Start (or join) a download. A submission whose fingerprint matches an
    /// active download returns the existing task instead of starting another.
    pub fn start(
        &self,
        repo_id: &str,
        revision: Option<&str>,
        allow_patterns: &[String],
        ignore_patterns: &[String],
    ) -> Result<DownloadTask, LmxError> {
        let key = fingerprint(repo_id, revision, allow_patterns, ignore_patterns);
        if let Some(existing_id) = self.active_by_key.get(&key) {
            if let Some(task) = self.tasks.get(existing_id.value()) {
                if task.status == DownloadStatus::Downloading {
                    return Ok(task.clone());
                }
            }
        }

        let free = (self.free_disk_probe)(&self.cache_dir);
        if free < self.min_free_disk_gb {
            return Err(LmxError::InsufficientDisk {
                message: format!(
                    "Refusing download of '{repo_id}': {free:.1} GB free disk is below the \
                     {:.1} GB floor",
                    self.min_free_disk_gb
                ),
            });
        }

        let task = DownloadTask {
            download_id: Uuid::new_v4().to_string(),
            repo_id: repo_id.to_string(),
            status: DownloadStatus::Downloading,
            downloaded_bytes: 0,
            total_bytes: None,
            progress_percent: None,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        };
        self.tasks.insert(task.download_id.clone(), task.clone());
        self.active_by_key.insert(key.clone(), task.download_id.clone());

        self.spawn_fetch(task.clone(), key, revision.map(str::to_string));
        Ok(task)
    }

    fn spawn_fetch(&self, task: DownloadTask, key: String, revision: Option<String>) {
        let fetcher = Arc::clone(&self.fetcher);
        let tasks = Arc::clone(&self.tasks);
        let active_by_key = Arc::clone(&self.active_by_key);
        let cancel = self.cancel.child_token();
        let dest = local_model_dir(&self.cache_dir, &task.repo_id);
        let download_id = task.download_id.clone();
        let repo_id = task.repo_id.clone();

        let progress: ProgressFn = {
            let tasks = Arc::clone(&tasks);
            let download_id = download_id.clone();
            Arc::new(move |downloaded, total| {
                if let Some(mut task) = tasks.get_mut(&download_id) {
                    task.downloaded_bytes = downloaded;
                    task.total_bytes = total;
                    task.progress_percent = total
                        .filter(|t| *t > 0)
                        .map(|t| (downloaded as f64 / t as f64) * 100.0);
                }
            })
        };

        tokio::spawn(async move {
            let result = fetcher
                .fetch(&repo_id, revision.as_deref(), &dest, progress, cancel.clone())
                .await;

            if let Some(mut task) = tasks.get_mut(&download_id) {
                task.completed_at = Some(Utc::now());
                match result {
                    Ok(()) => {
                        task.status = DownloadStatus::Completed;
                        task.progress_percent = Some(100.0);
                        tracing::info!(repo_id, download_id, "download_completed");
                    }
                    Err(error) => {
                        task.status = DownloadStatus::Failed;
                        task.error = Some(error.to_string());
                        tracing::warn!(repo_id, download_id, %error, "download_failed");
                    }
                }
            }
            active_by_key.remove(&key);

            // Reap the terminal record after the retention window.
            tokio::select! {
                _ = tokio::time::sleep(TERMINAL_RETENTION) => {
                    tasks.remove(&download_id);
                }
                _ = cancel.cancelled() => {}
            }
        });
    }

    pub fn get(&self, download_id: &str) -> Option<DownloadTask> {
        self.tasks.get(download_id).map(|t| t.clone())
    }

    pub fn list(&self) -> Vec<DownloadTask> {
        let mut all: Vec<_> = self.tasks.iter().map(|t| t.clone()).collect();
        all.sort_by_key(|t| t.started_at);
        all
    }

    /// Cancel every active download and stop the coordinator.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

/// Filesystem location of a model's local snapshot.
pub fn local_model_dir(cache_dir: &Path, model_id: &str) -> PathBuf {
    // A filesystem path passed as a model id is its own snapshot location.
    let as_path = Path::new(model_id);
    if as_path.is_absolute() {
        return as_path.to_path_buf();
    }
    cache_dir.join(model_id.replace('/', "--"))
}

/// Whether every weight file referenced by the snapshot's safetensors index
/// exists on disk. Models without an index (single-file, gguf) pass when any
/// weight file is present.
pub fn is_local_snapshot_complete(cache_dir: &Path, model_id: &str) -> bool {
    let dir = local_model_dir(cache_dir, model_id);
    if !dir.is_dir() {
        return false;
    }

    let index_path = dir.join("model.safetensors.index.json");
    if let Ok(content) = std::fs::read_to_string(&index_path) {
        let Ok(index) = serde_json::from_str::<serde_json::Value>(&content) else {
            return false;
        };
        let Some(weight_map) = index.get("weight_map").and_then(|w| w.as_object()) else {
            return false;
        };
        let mut files: Vec<&str> = weight_map
            .values()
            .filter_map(|v| v.as_str())
            .collect();
        files.sort_unstable();
        files.dedup();
        return !files.is_empty() && files.iter().all(|f| dir.join(f).is_file());
    }

    has_weight_file(&dir)
}

/// Local GGUF files that can stand in for a non-gguf model id.
pub fn resolve_local_gguf_equivalents(cache_dir: &Path, model_id: &str) -> Vec<PathBuf> {
    let dir = local_model_dir(cache_dir, model_id);
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "gguf"))
        .collect();
    found.sort();
    found
}

fn has_weight_file(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.flatten().any(|e| {
        e.path()
            .extension()
            .is_some_and(|ext| ext == "safetensors" || ext == "gguf")
    })
}

fn fingerprint(
    repo_id: &str,
    revision: Option<&str>,
    allow_patterns: &[String],
    ignore_patterns: &[String],
) -> String {
    let mut allow = allow_patterns.to_vec();
    allow.sort();
    let mut ignore = ignore_patterns.to_vec();
    ignore.sort();

    let mut hasher = Sha256::new();
    hasher.update(repo_id.as_bytes());
    hasher.update([0]);
    hasher.update(revision.unwrap_or("main").as_bytes());
    hasher.update([0]);
    hasher.update(allow.join(",").as_bytes());
    hasher.update([0]);
    hasher.update(ignore.join(",").as_bytes());
    hex::encode(hasher.finalize())
}

fn free_disk_gb(path: &Path) -> f64 {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let mut best: Option<(usize, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if path.starts_with(mount) {
            let depth = mount.components().count();
            if best.is_none_or(|(d, _)| depth > d) {
                best = Some((depth, disk.available_space()));
            }
        }
    }
    best.map(|(_, bytes)| bytes as f64 / (1024.0 * 1024.0 * 1024.0))
        .unwrap_or(f64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted fetcher: waits for release, then succeeds or fails.
    struct ScriptedFetcher {
        fail: bool,
        delay_ms: u64,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new(fail: bool, delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                fail,
                delay_ms,
                calls: std::sync::atomic::AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            _repo_id: &str,
            _revision: Option<&str>,
            _dest: &Path,
            progress: ProgressFn,
            cancel: CancellationToken,
        ) -> anyhow::Result<()> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            progress(512, Some(1024));
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.delay_ms)) => {}
                _ = cancel.cancelled() => anyhow::bail!("download cancelled"),
            }
            if self.fail {
                anyhow::bail!("network unreachable")
            }
            Ok(())
        }
    }

    fn coordinator(fetcher: Arc<ScriptedFetcher>, dir: &Path) -> DownloadCoordinator {
        DownloadCoordinator::new(dir.to_path_buf(), 5.0, fetcher)
            .with_free_disk_probe(|_| 100.0)
    }

    async fn wait_terminal(coordinator: &DownloadCoordinator, id: &str) -> DownloadTask {
        for _ in 0..100 {
            let task = coordinator.get(id).expect("task exists");
            if task.status != DownloadStatus::Downloading {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("download never reached a terminal state");
    }

    // -----------------------------------------------------------------------
    // Coordinator
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn download_completes_and_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(false, 20);
        let coordinator = coordinator(Arc::clone(&fetcher), dir.path());

        let task = coordinator.start("org/model", None, &[], &[]).unwrap();
        assert_eq!(task.status, DownloadStatus::Downloading);

        let done = wait_terminal(&coordinator, &task.download_id).await;
        assert_eq!(done.status, DownloadStatus::Completed);
        assert_eq!(done.progress_percent, Some(100.0));
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn failed_download_records_error() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(true, 10);
        let coordinator = coordinator(Arc::clone(&fetcher), dir.path());

        let task = coordinator.start("org/model", None, &[], &[]).unwrap();
        let done = wait_terminal(&coordinator, &task.download_id).await;
        assert_eq!(done.status, DownloadStatus::Failed);
        assert!(done.error.unwrap().contains("network unreachable"));
    }

    #[tokio::test]
    async fn identical_submission_joins_active_download() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(false, 200);
        let coordinator = coordinator(Arc::clone(&fetcher), dir.path());

        let first = coordinator.start("org/model", None, &[], &[]).unwrap();
        let second = coordinator.start("org/model", None, &[], &[]).unwrap();
        assert_eq!(first.download_id, second.download_id);
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn different_revision_is_a_different_download() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(false, 200);
        let coordinator = coordinator(Arc::clone(&fetcher), dir.path());

        let first = coordinator.start("org/model", None, &[], &[]).unwrap();
        let second = coordinator
            .start("org/model", Some("refs/pr/1"), &[], &[])
            .unwrap();
        assert_ne!(first.download_id, second.download_id);
    }

    #[tokio::test]
    async fn pattern_order_does_not_change_fingerprint() {
        let a = fingerprint("org/m", None, &["*.json".into(), "*.txt".into()], &[]);
        let b = fingerprint("org/m", None, &["*.txt".into(), "*.json".into()], &[]);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn disk_floor_refuses_download() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(false, 10);
        let coordinator = DownloadCoordinator::new(dir.path().to_path_buf(), 5.0, fetcher)
            .with_free_disk_probe(|_| 2.0);

        let err = coordinator.start("org/model", None, &[], &[]).unwrap_err();
        assert_eq!(err.code(), "insufficient_disk");
    }

    #[tokio::test]
    async fn shutdown_cancels_active_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(false, 10_000);
        let coordinator = coordinator(Arc::clone(&fetcher), dir.path());

        let task = coordinator.start("org/model", None, &[], &[]).unwrap();
        coordinator.shutdown();

        let done = wait_terminal(&coordinator, &task.download_id).await;
        assert_eq!(done.status, DownloadStatus::Failed);
        assert!(done.error.unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn unknown_download_id_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(ScriptedFetcher::new(false, 10), dir.path());
        assert!(coordinator.get("nope").is_none());
    }

    // -----------------------------------------------------------------------
    // Snapshot guards
    // -----------------------------------------------------------------------

    #[test]
    fn model_dir_replaces_slashes() {
        let dir = local_model_dir(Path::new("/cache"), "org/model");
        assert_eq!(dir, PathBuf::from("/cache/org--model"));
    }

    #[test]
    fn absolute_path_model_id_is_its_own_dir() {
        let dir = local_model_dir(Path::new("/cache"), "/models/llama.gguf");
        assert_eq!(dir, PathBuf::from("/models/llama.gguf"));
    }

    #[test]
    fn snapshot_complete_with_full_index() {
        let cache = tempfile::tempdir().unwrap();
        let dir = cache.path().join("org--m");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("model.safetensors.index.json"),
            r#"{"weight_map": {"a.bias": "model-00001.safetensors", "b.bias": "model-00002.safetensors"}}"#,
        )
        .unwrap();
        std::fs::write(dir.join("model-00001.safetensors"), b"x").unwrap();
        std::fs::write(dir.join("model-00002.safetensors"), b"x").unwrap();

        assert!(is_local_snapshot_complete(cache.path(), "org/m"));
    }

    #[test]
    fn snapshot_incomplete_when_indexed_file_missing() {
        let cache = tempfile::tempdir().unwrap();
        let dir = cache.path().join("org--m");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("model.safetensors.index.json"),
            r#"{"weight_map": {"a.bias": "model-00001.safetensors", "b.bias": "model-00002.safetensors"}}"#,
        )
        .unwrap();
        std::fs::write(dir.join("model-00001.safetensors"), b"x").unwrap();

        assert!(!is_local_snapshot_complete(cache.path(), "org/m"));
    }

    #[test]
    fn snapshot_without_index_passes_with_any_weight_file() {
        let cache = tempfile::tempdir().unwrap();
        let dir = cache.path().join("org--m");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("model.safetensors"), b"x").unwrap();
        assert!(is_local_snapshot_complete(cache.path(), "org/m"));
    }

    #[test]
    fn missing_dir_is_incomplete() {
        let cache = tempfile::tempdir().unwrap();
        assert!(!is_local_snapshot_complete(cache.path(), "never/downloaded"));
    }

    #[test]
    fn gguf_equivalents_are_sorted() {
        let cache = tempfile::tempdir().unwrap();
        let dir = cache.path().join("org--m");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("b.gguf"), b"x").unwrap();
        std::fs::write(dir.join("a.gguf"), b"x").unwrap();
        std::fs::write(dir.join("notes.txt"), b"x").unwrap();

        let found = resolve_local_gguf_equivalents(cache.path(), "org/m");
        assert_eq!(found.len(), 2);
        assert!(found[0].ends_with("a.gguf"));
    }
}
