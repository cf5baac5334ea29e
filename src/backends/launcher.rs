//! Runtime server process management.
//!
//! Spawns a model's runtime server as a child process from a config command
//! template, waits for its health endpoint to answer, and reports structured
//! failures (exit code, signal) when bring-up dies. This is the process-level
//! isolation boundary: an import-time or GPU bring-up crash kills the child,
//! not the server.

use std::time::Duration;

use anyhow::Context;
use tokio::process::{Child, Command};

use crate::error::LmxError;

/// Hands out ports for spawned runtime servers, one range per backend kind.
#[derive(Debug)]
pub struct PortAllocator {
    next: std::sync::atomic::AtomicU16,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        Self {
            next: std::sync::atomic::AtomicU16::new(base),
        }
    }

    pub fn allocate(&self) -> u16 {
        self.next.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }
}

/// A spawned runtime server child. Killed on [`RuntimeProcess::shutdown`] or
/// when dropped (kill-on-drop is set on the command).
#[derive(Debug)]
pub struct RuntimeProcess {
    child: Child,
    pub port: u16,
}

impl RuntimeProcess {
    pub async fn shutdown(&mut self) {
        if let Err(error) = self.child.start_kill() {
            tracing::debug!(%error, "runtime child already gone");
        }
        let _ = self.child.wait().await;
    }
}

/// Outcome of a spawn probe, mirroring what the loader supervisor reports.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub ok: bool,
    pub reason: Option<String>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProbeReport {
    fn pass() -> Self {
        Self {
            ok: true,
            reason: None,
            exit_code: None,
            signal: None,
        }
    }
}

/// Render a command template, substituting `{model}` and `{port}`.
fn render_command(template: &str, model_id: &str, port: u16) -> Vec<String> {
    template
        .replace("{model}", model_id)
        .replace("{port}", &port.to_string())
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Spawn a runtime server and wait until `health_url` answers 2xx.
///
/// Fails with [`LmxError::ModelLoaderCrashed`] when the child exits during
/// bring-up and [`LmxError::ModelLoadTimeout`] when it never becomes healthy.
pub async fn spawn_runtime(
    command_template: &str,
    model_id: &str,
    port: u16,
    health_url: &str,
    timeout: Duration,
) -> Result<RuntimeProcess, LmxError> {
    let argv = render_command(command_template, model_id, port);
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| LmxError::invalid_request("runtime command template is empty"))?;

    tracing::info!(model_id, program, port, "runtime_spawn");
    let child = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .with_context(|| format!("spawning runtime `{program}`"))?;

    let mut process = RuntimeProcess { child, port };
    match wait_healthy(&mut process, model_id, health_url, timeout).await {
        Ok(()) => Ok(process),
        Err(err) => {
            process.shutdown().await;
            Err(err)
        }
    }
}

/// Spawn-probe: bring the runtime up, confirm health, tear it down again.
/// Never leaves a process behind. Returns a report instead of failing so the
/// caller can record the outcome as a compatibility row.
pub async fn probe_spawn(
    command_template: &str,
    model_id: &str,
    port: u16,
    health_url: &str,
    timeout: Duration,
) -> ProbeReport {
    match spawn_runtime(command_template, model_id, port, health_url, timeout).await {
        Ok(mut process) => {
            process.shutdown().await;
            ProbeReport::pass()
        }
        Err(LmxError::ModelLoaderCrashed {
            exit_code, signal, ..
        }) => ProbeReport {
            ok: false,
            reason: Some("loader_crashed".into()),
            exit_code,
            signal,
        },
        Err(err) => ProbeReport {
            ok: false,
            reason: Some(err.to_string()),
            exit_code: None,
            signal: None,
        },
    }
}

async fn wait_healthy(
    process: &mut RuntimeProcess,
    model_id: &str,
    health_url: &str,
    timeout: Duration,
) -> Result<(), LmxError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .map_err(anyhow::Error::from)?;
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        // A child that exited during bring-up is a crash, not a timeout.
        if let Ok(Some(status)) = process.child.try_wait() {
            return Err(LmxError::ModelLoaderCrashed {
                model_id: model_id.to_string(),
                exit_code: status.code(),
                signal: exit_signal(&status),
            });
        }

        if let Ok(response) = client.get(health_url).send().await {
            if response.status().is_success() {
                return Ok(());
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(LmxError::ModelLoadTimeout {
                model_id: model_id.to_string(),
                timeout_sec: timeout.as_secs(),
            });
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
