//! Agent run data model: requests, runs, steps, and the idempotency
//! fingerprint.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// How a run's roles are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStrategy {
    /// Roles run sequentially; each sees preceding outputs.
    Handoff,
    /// Roles run concurrently under `max_parallelism`.
    ParallelMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub strategy: RunStrategy,
    pub prompt: String,
    pub roles: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub role_models: HashMap<String, String>,
    #[serde(default)]
    pub max_parallelism: Option<usize>,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub token_budget: Option<u64>,
    #[serde(default)]
    pub traceparent: Option<String>,
    #[serde(default)]
    pub submitted_by: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub approval_required: bool,
}

impl AgentRequest {
    pub fn new(strategy: RunStrategy, prompt: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            strategy,
            prompt: prompt.into(),
            roles,
            model: None,
            role_models: HashMap::new(),
            max_parallelism: None,
            timeout_sec: None,
            priority: None,
            token_budget: None,
            traceparent: None,
            submitted_by: None,
            metadata: None,
            approval_required: false,
        }
    }

    /// Stable hash of the normalized request, used to detect idempotency-key
    /// reuse with different payloads. serde_json maps are sorted, so the
    /// serialization is canonical.
    pub fn fingerprint(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        let canonical = serde_json::to_string(&value).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    pub id: String,
    pub role: String,
    pub status: StepStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentStep {
    pub fn pending(role: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: role.to_string(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            output: None,
            tokens_used: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: String,
    pub request: AgentRequest,
    pub status: RunStatus,
    pub steps: Vec<AgentStep>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub resolved_model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRun {
    pub fn queued(request: AgentRequest) -> Self {
        let now = Utc::now();
        let steps = request.roles.iter().map(|r| AgentStep::pending(r)).collect();
        Self {
            id: Uuid::new_v4().to_string(),
            request,
            status: RunStatus::Queued,
            steps,
            result: None,
            error: None,
            resolved_model: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_for_identical_requests() {
        let a = AgentRequest::new(RunStrategy::Handoff, "analyse", vec!["writer".into()]);
        let b = AgentRequest::new(RunStrategy::Handoff, "analyse", vec!["writer".into()]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_differs_on_any_field_change() {
        let base = AgentRequest::new(RunStrategy::Handoff, "A", vec!["writer".into()]);
        let mut other_prompt = base.clone();
        other_prompt.prompt = "B".into();
        let mut other_strategy = base.clone();
        other_strategy.strategy = RunStrategy::ParallelMap;

        assert_ne!(base.fingerprint(), other_prompt.fingerprint());
        assert_ne!(base.fingerprint(), other_strategy.fingerprint());
    }

    #[test]
    fn queued_run_has_one_pending_step_per_role() {
        let request = AgentRequest::new(
            RunStrategy::ParallelMap,
            "go",
            vec!["a".into(), "b".into(), "c".into()],
        );
        let run = AgentRun::queued(request);
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.steps.len(), 3);
        assert!(run.steps.iter().all(|s| s.status == StepStatus::Pending));
        // Step ids are unique.
        let mut ids: Vec<&str> = run.steps.iter().map(|s| s.id.as_str()).collect();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn terminal_statuses_are_detected() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn run_round_trips_through_json() {
        let run = AgentRun::queued(AgentRequest::new(
            RunStrategy::Handoff,
            "hello",
            vec!["solo".into()],
        ));
        let encoded = serde_json::to_string(&run).unwrap();
        let decoded: AgentRun = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, run.id);
        assert_eq!(decoded.steps.len(), 1);
    }
}
