//! Speculative-decoding telemetry accumulation.
//!
//! Backend payloads are probed by name for draft-token counters. The field
//! lists below were derived from observed runtime payloads and must be kept
//! verbatim — different runtime versions report under different names and
//! there is no canonical one.

use serde_json::Value;

use super::types::{SpeculativeStatus, SpeculativeTelemetry, TelemetryMode};

const ACCEPTED_FIELDS: &[&str] = &[
    "accepted_tokens",
    "draft_accepted_tokens",
    "speculative_accepted_tokens",
];

const REJECTED_FIELDS: &[&str] = &[
    "rejected_tokens",
    "draft_rejected_tokens",
    "rejected_draft_tokens",
    "num_rejected_draft_tokens",
    "speculative_rejected_tokens",
];

const IGNORED_FIELDS: &[&str] = &[
    "ignored_tokens",
    "draft_ignored_tokens",
    "speculative_ignored_tokens",
];

const FROM_DRAFT_FIELDS: &[&str] = &["from_draft", "draft_accepted", "accepted_from_draft"];

/// Rolling per-request accumulator, created from the loaded model's
/// speculative status and updated from each backend payload.
#[derive(Debug, Clone)]
pub struct TelemetryAccumulator {
    telemetry: SpeculativeTelemetry,
}

impl TelemetryAccumulator {
    pub fn new(status: &SpeculativeStatus) -> Self {
        let mode = if !status.requested {
            TelemetryMode::NotRequested
        } else if !status.active {
            TelemetryMode::Disabled
        } else {
            TelemetryMode::Unavailable
        };
        Self {
            telemetry: SpeculativeTelemetry {
                requested: status.requested,
                active: status.active,
                reason: status.reason.clone(),
                draft_model: status.draft_model.clone(),
                num_tokens: status.num_tokens,
                accepted_tokens: 0,
                rejected_tokens: 0,
                ignored_tokens: 0,
                acceptance_ratio: None,
                telemetry: mode,
            },
        }
    }

    /// Fold one backend payload into the counters. No-op unless speculative
    /// decoding is active for the model.
    ///
    /// Native integer fields win; otherwise a single boolean `from_draft`
    /// style flag counts one accepted or rejected token.
    pub fn update_from_payload(&mut self, payload: Option<&Value>) {
        if !self.telemetry.active {
            return;
        }
        let Some(payload) = payload else { return };

        let accepted = read_int_field(payload, ACCEPTED_FIELDS);
        let rejected = read_int_field(payload, REJECTED_FIELDS);
        let ignored = read_int_field(payload, IGNORED_FIELDS);

        if accepted.is_some() || rejected.is_some() || ignored.is_some() {
            self.telemetry.accepted_tokens += accepted.unwrap_or(0);
            self.telemetry.rejected_tokens += rejected.unwrap_or(0);
            self.telemetry.ignored_tokens += ignored.unwrap_or(0);
            self.telemetry.telemetry = TelemetryMode::Native;
            return;
        }

        if let Some(from_draft) = read_bool_field(payload, FROM_DRAFT_FIELDS) {
            if from_draft {
                self.telemetry.accepted_tokens += 1;
            } else {
                self.telemetry.rejected_tokens += 1;
            }
            self.telemetry.telemetry = TelemetryMode::InferredFromFlag;
        }
    }

    /// Close out the request. When speculative decoding was active but no
    /// counter ever moved, the whole completion is marked ignored.
    pub fn finalize(mut self, completion_units: u64) -> SpeculativeTelemetry {
        let t = &mut self.telemetry;
        if t.active
            && t.accepted_tokens == 0
            && t.rejected_tokens == 0
            && t.ignored_tokens == 0
        {
            t.ignored_tokens = completion_units;
            t.telemetry = TelemetryMode::Unavailable;
        }
        let judged = t.accepted_tokens + t.rejected_tokens;
        t.acceptance_ratio = if judged > 0 {
            Some(t.accepted_tokens as f64 / judged as f64)
        } else {
            None
        };
        self.telemetry
    }
}

/// Probe `payload` (and its `usage` / `speculative` sub-objects) for the
/// first present field among `keys`, as a non-negative integer.
fn read_int_field(payload: &Value, keys: &[&str]) -> Option<u64> {
    for mapping in candidate_mappings(payload) {
        for key in keys {
            if let Some(value) = mapping.get(*key) {
                if let Some(n) = value.as_u64() {
                    return Some(n);
                }
                if let Some(n) = value.as_i64() {
                    return Some(n.max(0) as u64);
                }
            }
        }
    }
    None
}

fn read_bool_field(payload: &Value, keys: &[&str]) -> Option<bool> {
    for mapping in candidate_mappings(payload) {
        for key in keys {
            if let Some(value) = mapping.get(*key).and_then(Value::as_bool) {
                return Some(value);
            }
        }
    }
    None
}

fn candidate_mappings(payload: &Value) -> Vec<&serde_json::Map<String, Value>> {
    let mut mappings = Vec::new();
    if let Some(map) = payload.as_object() {
        mappings.push(map);
        for nested in ["speculative", "usage"] {
            if let Some(inner) = map.get(nested).and_then(Value::as_object) {
                mappings.push(inner);
            }
        }
    }
    mappings
}
