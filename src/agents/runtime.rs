//! Multi-agent run scheduler.
//!
//! Runs enter a bounded queue and are executed by a worker task: roles run
//! sequentially (`handoff`, each step seeing preceding outputs) or
//! concurrently (`parallel_map`, bounded by `max_parallelism`). Steps retry
//! transient busy errors, a token budget is enforced before each step, and
//! every status transition is written to the state store. On construction the
//! store is replayed and anything left `queued` or `running` by a previous
//! process is marked failed as interrupted.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{
    config::AgentsConfig,
    error::LmxError,
    events::EventBus,
    inference::{
        ChatMessage, CompletionResult, GenerateParams, InferenceEngine, RequestTelemetry,
    },
    registry::ReadinessState,
};

use super::{
    store::RunStore,
    types::{AgentRequest, AgentRun, RunStatus, RunStrategy, StepStatus},
};

/// The slice of the engine the scheduler needs. The indirection keeps fault
/// injection possible in tests without a live backend.
#[async_trait]
pub trait RunEngine: Send + Sync {
    async fn generate(
        &self,
        params: GenerateParams,
    ) -> Result<(CompletionResult, RequestTelemetry), LmxError>;

    /// Model ids currently accepting inference requests.
    fn routable_models(&self) -> Vec<String>;
}

#[async_trait]
impl RunEngine for InferenceEngine {
    async fn generate(
        &self,
        params: GenerateParams,
    ) -> Result<(CompletionResult, RequestTelemetry), LmxError> {
        InferenceEngine::generate(self, params).await
    }

    fn routable_models(&self) -> Vec<String> {
        self.get_loaded_models()
            .into_iter()
            .map(|m| m.model_id)
            .filter(|id| {
                self.model_readiness(id)
                    .is_some_and(|r| r.state == ReadinessState::Routable)
            })
            .collect()
    }
}

pub struct AgentRuntime {
    engine: Arc<dyn RunEngine>,
    config: AgentsConfig,
    store: RunStore,
    runs: Mutex<HashMap<String, AgentRun>>,
    /// `Idempotency-Key → (request fingerprint, run id)`.
    idempotency: Mutex<HashMap<String, (String, String)>>,
    queue_tx: mpsc::Sender<String>,
    cancels: DashMap<String, CancellationToken>,
    bus: EventBus,
}

impl AgentRuntime {
    /// Build the runtime, recover persisted state, and start the worker.
    pub fn start(
        engine: Arc<dyn RunEngine>,
        config: AgentsConfig,
        store: RunStore,
        bus: EventBus,
    ) -> Arc<Self> {
        let mut recovered: HashMap<String, AgentRun> = HashMap::new();
        for mut run in store.load_all() {
            if !run.status.is_terminal() {
                run.status = RunStatus::Failed;
                run.error = Some("Run interrupted by server restart".into());
                for step in &mut run.steps {
                    if !matches!(step.status, StepStatus::Completed | StepStatus::Failed) {
                        step.status = StepStatus::Cancelled;
                    }
                }
                run.touch();
                store.save(&run);
                tracing::warn!(run_id = run.id, "agent_run_recovered_as_interrupted");
            }
            recovered.insert(run.id.clone(), run);
        }

        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let runtime = Arc::new(Self {
            engine,
            config,
            store,
            runs: Mutex::new(recovered),
            idempotency: Mutex::new(HashMap::new()),
            queue_tx,
            cancels: DashMap::new(),
            bus,
        });

        tokio::spawn(Self::worker(Arc::clone(&runtime), queue_rx));
        runtime
    }

    async fn worker(this: Arc<Self>, mut queue_rx: mpsc::Receiver<String>) {
        while let Some(run_id) = queue_rx.recv().await {
            this.execute_run(&run_id).await;
        }
    }

    // ── Submission ──────────────────────────────────────────────────────

    /// Validate and enqueue a run. With an idempotency key, an identical
    /// resubmission returns the prior run; a different payload under the same
    /// key conflicts. A full queue yields a run created directly in `failed`
    /// state whose error names the full queue.
    pub fn submit(
        &self,
        mut request: AgentRequest,
        idempotency_key: Option<&str>,
    ) -> Result<AgentRun, LmxError> {
        if request.roles.is_empty() {
            return Err(LmxError::invalid_param("at least one role is required", "roles"));
        }
        if request.roles.len() > self.config.max_steps_per_run {
            return Err(LmxError::invalid_param(
                format!(
                    "{} roles exceed the limit of {} steps per run",
                    request.roles.len(),
                    self.config.max_steps_per_run
                ),
                "roles",
            ));
        }
        if request.timeout_sec.is_none() {
            request.timeout_sec = Some(self.config.default_timeout_sec);
        }

        let fingerprint = request.fingerprint();
        if let Some(key) = idempotency_key {
            let idempotency = self.idempotency.lock().expect("idempotency lock poisoned");
            if let Some((prior_fingerprint, run_id)) = idempotency.get(key) {
                if *prior_fingerprint == fingerprint {
                    if let Some(existing) = self.get(run_id) {
                        tracing::info!(run_id, key, "idempotent_resubmission");
                        return Ok(existing);
                    }
                }
                return Err(LmxError::IdempotencyConflict { key: key.to_string() });
            }
        }

        let run = AgentRun::queued(request);
        self.runs
            .lock()
            .expect("runs lock poisoned")
            .insert(run.id.clone(), run.clone());
        self.store.save(&run);
        self.publish_update(&run);

        match self.queue_tx.try_send(run.id.clone()) {
            Ok(()) => {
                if let Some(key) = idempotency_key {
                    self.idempotency
                        .lock()
                        .expect("idempotency lock poisoned")
                        .insert(key.to_string(), (fingerprint, run.id.clone()));
                }
                Ok(run)
            }
            Err(_) => {
                let failed = self
                    .update_run(&run.id, |run| {
                        run.status = RunStatus::Failed;
                        run.error = Some("Run queue is full — try again shortly".into());
                        for step in &mut run.steps {
                            step.status = StepStatus::Cancelled;
                        }
                    })
                    .expect("run just inserted");
                tracing::warn!(run_id = failed.id, "agent_queue_saturated");
                Ok(failed)
            }
        }
    }

    pub fn get(&self, run_id: &str) -> Option<AgentRun> {
        self.runs
            .lock()
            .expect("runs lock poisoned")
            .get(run_id)
            .cloned()
    }

    /// Runs newest first.
    pub fn list(&self, limit: usize) -> Vec<AgentRun> {
        let runs = self.runs.lock().expect("runs lock poisoned");
        let mut all: Vec<AgentRun> = runs.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all.truncate(limit);
        all
    }

    /// Cooperative cancel: the run flips to `cancelled` immediately and the
    /// executing task is signalled. A step already inside the backend call is
    /// allowed to wind down; further steps do not start.
    pub fn cancel(&self, run_id: &str) -> Result<AgentRun, LmxError> {
        let current = self.get(run_id).ok_or_else(|| LmxError::RunNotFound {
            run_id: run_id.to_string(),
        })?;
        if current.status.is_terminal() {
            return Ok(current);
        }

        if let Some(token) = self.cancels.get(run_id) {
            token.cancel();
        }

        let run = self
            .update_run(run_id, |run| {
                run.status = RunStatus::Cancelled;
                run.error = Some("Cancelled by caller".into());
                for step in &mut run.steps {
                    if step.status == StepStatus::Pending {
                        step.status = StepStatus::Cancelled;
                    }
                }
            })
            .expect("run exists");
        self.publish_terminal(&run);
        Ok(run)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<crate::events::ServerEvent> {
        self.bus.subscribe()
    }

    // ── Execution ───────────────────────────────────────────────────────

    async fn execute_run(self: &Arc<Self>, run_id: &str) {
        let Some(run) = self.get(run_id) else { return };
        // Cancelled (or failed-at-submit) while still queued.
        if run.status != RunStatus::Queued {
            return;
        }

        let token = CancellationToken::new();
        self.cancels.insert(run_id.to_string(), token.clone());

        // A cancel can land between dequeue and this transition; never
        // resurrect a terminal run.
        let Some(updated) = self.update_run(run_id, |run| {
            if run.status == RunStatus::Queued {
                run.status = RunStatus::Running;
            }
        }) else {
            self.cancels.remove(run_id);
            return;
        };
        if updated.status != RunStatus::Running {
            self.cancels.remove(run_id);
            return;
        }
        self.publish_update(&updated);

        let timeout_sec = run
            .request
            .timeout_sec
            .unwrap_or(self.config.default_timeout_sec)
            .max(1);
        let outcome = tokio::time::timeout(
            Duration::from_secs(timeout_sec),
            self.run_strategy(run_id, &run.request, token.clone()),
        )
        .await;

        if outcome.is_err() {
            tracing::warn!(run_id, timeout_sec, "agent_run_timed_out");
            token.cancel();
            self.update_run(run_id, |run| {
                if !run.status.is_terminal() {
                    run.status = RunStatus::Failed;
                    run.error = Some(format!("Run exceeded its {timeout_sec}s timeout"));
                }
                for step in &mut run.steps {
                    if matches!(step.status, StepStatus::Pending | StepStatus::Running) {
                        step.status = StepStatus::Cancelled;
                    }
                }
            });
        }

        self.cancels.remove(run_id);
        if let Some(final_run) = self.get(run_id) {
            self.publish_terminal(&final_run);
        }
        self.prune();
    }

    async fn run_strategy(
        self: &Arc<Self>,
        run_id: &str,
        request: &AgentRequest,
        token: CancellationToken,
    ) {
        match request.strategy {
            RunStrategy::Handoff => self.run_handoff(run_id, request, token).await,
            RunStrategy::ParallelMap => self.run_parallel_map(run_id, request, token).await,
        }
    }

    async fn run_handoff(
        self: &Arc<Self>,
        run_id: &str,
        request: &AgentRequest,
        token: CancellationToken,
    ) {
        let mut accumulated_tokens: u64 = 0;
        let mut outputs: Vec<(String, String)> = Vec::new();

        for index in 0..request.roles.len() {
            let role = request.roles[index].clone();

            if token.is_cancelled() {
                self.mark_remaining_cancelled(run_id, index);
                return;
            }

            if let Some(budget) = request.token_budget {
                let estimate = estimate_step_tokens(&request.prompt);
                if accumulated_tokens + estimate > budget {
                    let message = format!(
                        "Budget exhausted: {accumulated_tokens} tokens used plus an estimated \
                         {estimate} for step '{role}' exceeds the {budget} token budget"
                    );
                    self.fail_step_and_run(run_id, index, &message);
                    return;
                }
            }

            self.update_run(run_id, |run| {
                run.steps[index].status = StepStatus::Running;
                run.steps[index].started_at = Some(chrono::Utc::now());
            });

            match self.run_step(&role, request, &outputs).await {
                Ok((output, tokens_used, model)) => {
                    accumulated_tokens += tokens_used;
                    outputs.push((role.clone(), output.clone()));
                    self.update_run(run_id, |run| {
                        run.resolved_model.get_or_insert(model.clone());
                        let step = &mut run.steps[index];
                        step.status = StepStatus::Completed;
                        step.completed_at = Some(chrono::Utc::now());
                        step.output = Some(output.clone());
                        step.tokens_used = tokens_used;
                    });
                }
                Err(error) => {
                    self.fail_step_and_run(run_id, index, &error);
                    return;
                }
            }
        }

        let result = handoff_result(&outputs, accumulated_tokens);
        self.update_run(run_id, |run| {
            if !run.status.is_terminal() {
                run.status = RunStatus::Completed;
                run.result = Some(result.clone());
            }
        });
    }

    async fn run_parallel_map(
        self: &Arc<Self>,
        run_id: &str,
        request: &AgentRequest,
        token: CancellationToken,
    ) {
        let parallelism = request
            .max_parallelism
            .unwrap_or(request.roles.len())
            .max(1);
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let accumulated = Arc::new(AtomicU64::new(0));
        let first_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let mut tasks = tokio::task::JoinSet::new();
        for index in 0..request.roles.len() {
            let this = Arc::clone(self);
            let run_id = run_id.to_string();
            let request = request.clone();
            let token = token.clone();
            let semaphore = Arc::clone(&semaphore);
            let accumulated = Arc::clone(&accumulated);
            let first_error = Arc::clone(&first_error);

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let role = request.roles[index].clone();

                if token.is_cancelled() {
                    this.update_run(&run_id, |run| {
                        run.steps[index].status = StepStatus::Cancelled;
                    });
                    return;
                }

                if let Some(budget) = request.token_budget {
                    let estimate = estimate_step_tokens(&request.prompt);
                    if accumulated.load(Ordering::SeqCst) + estimate > budget {
                        let message = format!(
                            "Budget exhausted: estimated {estimate} tokens for step '{role}' \
                             exceeds the remaining {budget} token budget"
                        );
                        first_error.lock().expect("error lock").get_or_insert(message.clone());
                        this.update_run(&run_id, |run| {
                            let step = &mut run.steps[index];
                            step.status = StepStatus::Failed;
                            step.error = Some(message.clone());
                            step.completed_at = Some(chrono::Utc::now());
                        });
                        token.cancel();
                        return;
                    }
                }

                this.update_run(&run_id, |run| {
                    run.steps[index].status = StepStatus::Running;
                    run.steps[index].started_at = Some(chrono::Utc::now());
                });

                // A sibling failure cancels steps still in the backend call.
                let outcome = tokio::select! {
                    _ = token.cancelled() => None,
                    result = this.run_step(&role, &request, &[]) => Some(result),
                };

                match outcome {
                    None => {
                        this.update_run(&run_id, |run| {
                            run.steps[index].status = StepStatus::Cancelled;
                        });
                    }
                    Some(Ok((output, tokens_used, model))) => {
                        accumulated.fetch_add(tokens_used, Ordering::SeqCst);
                        this.update_run(&run_id, |run| {
                            run.resolved_model.get_or_insert(model.clone());
                            let step = &mut run.steps[index];
                            step.status = StepStatus::Completed;
                            step.completed_at = Some(chrono::Utc::now());
                            step.output = Some(output.clone());
                            step.tokens_used = tokens_used;
                        });
                    }
                    Some(Err(error)) => {
                        first_error.lock().expect("error lock").get_or_insert(error.clone());
                        this.update_run(&run_id, |run| {
                            let step = &mut run.steps[index];
                            step.status = StepStatus::Failed;
                            step.error = Some(error.clone());
                            step.completed_at = Some(chrono::Utc::now());
                        });
                        token.cancel();
                    }
                }
            });
        }

        while tasks.join_next().await.is_some() {}

        let error = first_error.lock().expect("error lock").clone();
        let total_tokens = accumulated.load(Ordering::SeqCst);
        self.update_run(run_id, |run| {
            if run.status.is_terminal() {
                return;
            }
            if let Some(error) = &error {
                run.status = RunStatus::Failed;
                run.error = Some(error.clone());
            } else if token.is_cancelled() {
                run.status = RunStatus::Cancelled;
            } else {
                run.status = RunStatus::Completed;
                let outputs: serde_json::Map<String, Value> = run
                    .steps
                    .iter()
                    .filter_map(|s| {
                        s.output
                            .as_ref()
                            .map(|o| (s.role.clone(), Value::String(o.clone())))
                    })
                    .collect();
                run.result = Some(json!({
                    "outputs": outputs,
                    "total_tokens": total_tokens,
                }));
            }
        });
    }

    /// One backend call on behalf of a role, with transient-busy retry.
    /// Returns `(output, tokens_used, resolved_model)`.
    async fn run_step(
        &self,
        role: &str,
        request: &AgentRequest,
        prior_outputs: &[(String, String)],
    ) -> Result<(String, u64, String), String> {
        let model = self.resolve_model(role, request)?;

        let mut system = format!("You are the '{role}' agent.");
        if !prior_outputs.is_empty() {
            system.push_str("\n\nPrevious agent outputs:");
            for (prior_role, output) in prior_outputs {
                system.push_str(&format!("\n[{prior_role}]\n{output}"));
            }
        }

        let mut params = GenerateParams::new(
            model.clone(),
            vec![
                ChatMessage::system(system),
                ChatMessage::user(request.prompt.clone()),
            ],
        );
        params.client_id = request.submitted_by.clone();
        params.priority = request.priority.clone();

        let max_attempts = 1 + self.config.step_retry_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.engine.generate(params.clone()).await {
                Ok((result, _telemetry)) => {
                    let output = result.message.content.unwrap_or_default();
                    return Ok((output, result.usage.total_tokens as u64, model));
                }
                Err(error) => {
                    let message = error.to_string();
                    let transient = message.contains("Server is busy");
                    if transient && attempt < max_attempts {
                        tracing::info!(
                            role,
                            attempt,
                            max_attempts,
                            "agent_step_retrying_after_busy"
                        );
                        tokio::time::sleep(Duration::from_secs_f64(
                            self.config.step_retry_backoff_sec.max(0.0),
                        ))
                        .await;
                        continue;
                    }
                    return Err(message);
                }
            }
        }
    }

    /// Pick the model for a role: per-role mapping, then the request model,
    /// then any routable model. Refuses when nothing is routable.
    fn resolve_model(&self, role: &str, request: &AgentRequest) -> Result<String, String> {
        let routable = self.engine.routable_models();
        let preferred = request
            .role_models
            .get(role)
            .or(request.model.as_ref());

        match preferred {
            Some(model) => {
                if routable.iter().any(|m| m == model) {
                    Ok(model.clone())
                } else {
                    Err(format!("No routable model '{model}' for role '{role}'"))
                }
            }
            None => routable
                .first()
                .cloned()
                .ok_or_else(|| format!("No routable model available for role '{role}'")),
        }
    }

    // ── Bookkeeping ─────────────────────────────────────────────────────

    fn update_run(&self, run_id: &str, mutate: impl FnOnce(&mut AgentRun)) -> Option<AgentRun> {
        let updated = {
            let mut runs = self.runs.lock().expect("runs lock poisoned");
            let run = runs.get_mut(run_id)?;
            mutate(run);
            run.touch();
            run.clone()
        };
        self.store.save(&updated);
        Some(updated)
    }

    fn fail_step_and_run(&self, run_id: &str, index: usize, error: &str) {
        let updated = self.update_run(run_id, |run| {
            let step = &mut run.steps[index];
            step.status = StepStatus::Failed;
            step.error = Some(error.to_string());
            step.completed_at = Some(chrono::Utc::now());
            for later in run.steps.iter_mut().skip(index + 1) {
                if later.status == StepStatus::Pending {
                    later.status = StepStatus::Cancelled;
                }
            }
            if !run.status.is_terminal() {
                run.status = RunStatus::Failed;
                run.error = Some(error.to_string());
            }
        });
        if let Some(run) = updated {
            self.publish_update(&run);
        }
    }

    fn mark_remaining_cancelled(&self, run_id: &str, from_index: usize) {
        self.update_run(run_id, |run| {
            for step in run.steps.iter_mut().skip(from_index) {
                if matches!(step.status, StepStatus::Pending | StepStatus::Running) {
                    step.status = StepStatus::Cancelled;
                }
            }
        });
    }

    fn publish_update(&self, run: &AgentRun) {
        self.bus.publish(
            "run.update",
            serde_json::to_value(run).unwrap_or(Value::Null),
        );
    }

    fn publish_terminal(&self, run: &AgentRun) {
        self.publish_update(run);
        if run.status.is_terminal() {
            self.bus.publish(
                "run.completed",
                serde_json::to_value(run).unwrap_or(Value::Null),
            );
        }
    }

    /// Bound the retained terminal runs; the store is compacted to match.
    fn prune(&self) {
        let retained = {
            let mut runs = self.runs.lock().expect("runs lock poisoned");
            let mut terminal: Vec<(String, chrono::DateTime<chrono::Utc>)> = runs
                .values()
                .filter(|r| r.status.is_terminal())
                .map(|r| (r.id.clone(), r.updated_at))
                .collect();
            if terminal.len() > self.config.retain_completed_runs {
                terminal.sort_by(|a, b| b.1.cmp(&a.1));
                for (id, _) in terminal.drain(self.config.retain_completed_runs..) {
                    runs.remove(&id);
                }
            }
            let retained: Vec<AgentRun> = runs.values().cloned().collect();
            retained
        };

        {
            let run_ids: std::collections::HashSet<&str> =
                retained.iter().map(|r| r.id.as_str()).collect();
            let mut idempotency = self.idempotency.lock().expect("idempotency lock poisoned");
            idempotency.retain(|_, (_, run_id)| run_ids.contains(run_id.as_str()));
        }

        self.store.compact(&retained);
    }
}

/// Cheap pre-step cost estimate: prompt size at the chars/4 heuristic.
fn estimate_step_tokens(prompt: &str) -> u64 {
    (prompt.chars().count() as u64).div_ceil(4)
}

fn handoff_result(outputs: &[(String, String)], total_tokens: u64) -> Value {
    let map: serde_json::Map<String, Value> = outputs
        .iter()
        .map(|(role, output)| (role.clone(), Value::String(output.clone())))
        .collect();
    json!({
        "final_output": outputs.last().map(|(_, o)| o.clone()).unwrap_or_default(),
        "outputs": map,
        "total_tokens": total_tokens,
    })
}
