//! Per-model readiness state machine.
//!
//! Readiness gates routing: only `routable` models accept inference requests.
//! The tracker owns a crash counter per model and promotes to `quarantined`
//! once failures reach the configured threshold. State changes into the
//! telemetry set are published as `model_readiness_changed` events.

use std::{collections::HashMap, sync::Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::events::EventBus;

/// Readiness lifecycle of one model.
///
/// Normal path: `admitted → loading → canary_pending → routable`.
/// Any state may drop to `quarantined` on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    Admitted,
    Loading,
    CanaryPending,
    Routable,
    Quarantined,
}

impl ReadinessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admitted => "admitted",
            Self::Loading => "loading",
            Self::CanaryPending => "canary_pending",
            Self::Routable => "routable",
            Self::Quarantined => "quarantined",
        }
    }
}

impl std::fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessRecord {
    pub state: ReadinessState,
    pub reason: Option<String>,
    pub crash_count: u32,
    pub last_failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ReadinessRecord {
    fn new(state: ReadinessState, reason: Option<String>) -> Self {
        Self {
            state,
            reason,
            crash_count: 0,
            last_failure_reason: None,
            updated_at: Utc::now(),
        }
    }
}

/// Mapping `model_id → ReadinessRecord` with serialized mutation.
pub struct ReadinessTracker {
    records: Mutex<HashMap<String, ReadinessRecord>>,
    bus: EventBus,
}

impl ReadinessTracker {
    pub fn new(bus: EventBus) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            bus,
        }
    }

    /// Write `state`, stamping `updated_at`. Publishes an event iff the state
    /// value actually changed.
    pub fn set_state(&self, model_id: &str, state: ReadinessState, reason: Option<&str>) {
        let previous_state;
        let current;
        {
            let mut records = self.lock();
            previous_state = records.get(model_id).map(|r| r.state);
            let record = records
                .entry(model_id.to_string())
                .or_insert_with(|| ReadinessRecord::new(state, None));
            record.state = state;
            record.reason = reason.map(str::to_string);
            record.updated_at = Utc::now();
            current = record.clone();
        }
        self.publish_if_changed(model_id, previous_state, &current);
    }

    /// Record a failure: increments `crash_count`, stores the reason, and
    /// promotes to `quarantined` once the counter reaches the threshold.
    /// Returns the record after the update.
    pub fn mark_failure(
        &self,
        model_id: &str,
        reason: &str,
        quarantine_threshold: u32,
    ) -> ReadinessRecord {
        let previous_state;
        let current;
        {
            let mut records = self.lock();
            previous_state = records.get(model_id).map(|r| r.state);
            let record = records
                .entry(model_id.to_string())
                .or_insert_with(|| ReadinessRecord::new(ReadinessState::Loading, None));
            record.crash_count += 1;
            record.last_failure_reason = Some(reason.to_string());
            if record.crash_count >= quarantine_threshold {
                record.state = ReadinessState::Quarantined;
                record.reason = Some(reason.to_string());
            }
            record.updated_at = Utc::now();
            current = record.clone();
        }
        self.publish_if_changed(model_id, previous_state, &current);
        current
    }

    pub fn is_routable(&self, model_id: &str) -> bool {
        self.lock()
            .get(model_id)
            .map(|r| r.state == ReadinessState::Routable)
            .unwrap_or(false)
    }

    pub fn get(&self, model_id: &str) -> Option<ReadinessRecord> {
        self.lock().get(model_id).cloned()
    }

    /// Remove the record entirely. Called on unload.
    pub fn clear(&self, model_id: &str) {
        self.lock().remove(model_id);
    }

    pub fn snapshot(&self) -> HashMap<String, ReadinessRecord> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ReadinessRecord>> {
        self.records.lock().expect("readiness lock poisoned")
    }

    fn publish_if_changed(
        &self,
        model_id: &str,
        previous: Option<ReadinessState>,
        current: &ReadinessRecord,
    ) {
        if previous == Some(current.state) {
            return;
        }
        self.bus.publish(
            "model_readiness_changed",
            json!({
                "model_id": model_id,
                "previous_state": previous.map(|s| s.as_str()),
                "state": current.state.as_str(),
                "reason": current.reason,
                "crash_count": current.crash_count,
                "updated_at": current.updated_at,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ReadinessTracker {
        ReadinessTracker::new(EventBus::new(16))
    }

    #[test]
    fn normal_promotion_path() {
        let t = tracker();
        for state in [
            ReadinessState::Admitted,
            ReadinessState::Loading,
            ReadinessState::CanaryPending,
            ReadinessState::Routable,
        ] {
            t.set_state("org/model", state, None);
        }
        assert!(t.is_routable("org/model"));
        assert_eq!(t.get("org/model").unwrap().state, ReadinessState::Routable);
    }

    #[test]
    fn unknown_model_is_not_routable() {
        assert!(!tracker().is_routable("never/seen"));
    }

    #[test]
    fn failures_below_threshold_do_not_quarantine() {
        let t = tracker();
        t.set_state("m", ReadinessState::Routable, None);
        let record = t.mark_failure("m", "backend_error", 3);
        assert_eq!(record.crash_count, 1);
        assert_eq!(record.state, ReadinessState::Routable);
        assert_eq!(record.last_failure_reason.as_deref(), Some("backend_error"));
    }

    #[test]
    fn failure_at_threshold_quarantines() {
        let t = tracker();
        t.set_state("m", ReadinessState::Routable, None);
        t.mark_failure("m", "boom", 3);
        t.mark_failure("m", "boom", 3);
        let record = t.mark_failure("m", "boom", 3);
        assert_eq!(record.state, ReadinessState::Quarantined);
        assert_eq!(record.crash_count, 3);
        assert!(!t.is_routable("m"));
    }

    #[test]
    fn threshold_one_quarantines_immediately() {
        let t = tracker();
        t.set_state("m", ReadinessState::Routable, None);
        let record = t.mark_failure("m", "inference_exception", 1);
        assert_eq!(record.state, ReadinessState::Quarantined);
    }

    #[test]
    fn clear_removes_the_record() {
        let t = tracker();
        t.set_state("m", ReadinessState::Routable, None);
        t.clear("m");
        assert!(t.get("m").is_none());
        assert!(!t.is_routable("m"));
    }

    #[test]
    fn updated_at_is_monotonic_across_transitions() {
        let t = tracker();
        t.set_state("m", ReadinessState::Admitted, None);
        let first = t.get("m").unwrap().updated_at;
        t.set_state("m", ReadinessState::Loading, None);
        let second = t.get("m").unwrap().updated_at;
        assert!(second >= first);
    }

    #[tokio::test]
    async fn state_change_publishes_event_once() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let t = ReadinessTracker::new(bus);

        t.set_state("m", ReadinessState::Loading, None);
        // Same state again — no second event.
        t.set_state("m", ReadinessState::Loading, Some("still loading"));
        t.set_state("m", ReadinessState::Routable, None);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.data["state"], "loading");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.data["state"], "routable");
        assert_eq!(second.data["previous_state"], "loading");
        assert!(rx.try_recv().is_err(), "no extra events expected");
    }
}
