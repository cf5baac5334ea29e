//! Backend selection policy.
//!
//! A pure function from `(model id, preferences, compatibility history)` to an
//! ordered candidate list. It never mutates anything — the lifecycle manager
//! passes a registry snapshot in and records outcomes back out after the load
//! attempt, so no cycle forms between policy and registries.

use crate::{
    config::BackendKind,
    error::LmxError,
    registry::{CompatOutcome, CompatibilityRegistry},
};

/// Compute the ordered backend candidates for `model_id`.
///
/// Rules, in order:
/// 1. GGUF models (id ends in `.gguf` or mentions `gguf`) are served by the
///    gguf backend only; a conflicting `preferred_backend` is rejected.
/// 2. Candidates start from `prefs`; `gguf` is appended iff fallback is on.
/// 3. A valid `preferred_backend` is promoted to the head.
/// 4. Unless `allow_failed`, backends whose most recent compatibility row for
///    this model is a failure are dropped.
/// 5. If the failure filter empties the list, the unfiltered list is returned
///    — a best-effort candidate beats refusing outright.
pub fn backend_candidates(
    model_id: &str,
    prefs: &[BackendKind],
    gguf_fallback: bool,
    registry: &CompatibilityRegistry,
    preferred_backend: Option<&str>,
    allow_failed: bool,
) -> Result<Vec<BackendKind>, LmxError> {
    if is_gguf_model(model_id) {
        if let Some(preferred) = preferred_backend {
            if BackendKind::parse(preferred) != Some(BackendKind::Gguf) {
                return Err(LmxError::invalid_param(
                    format!(
                        "Model '{model_id}' is a GGUF model and can only use the gguf \
                         backend, not '{preferred}'"
                    ),
                    "backend",
                ));
            }
        }
        return Ok(vec![BackendKind::Gguf]);
    }

    let mut candidates: Vec<BackendKind> = prefs.to_vec();
    if gguf_fallback && !candidates.contains(&BackendKind::Gguf) {
        candidates.push(BackendKind::Gguf);
    }

    if let Some(preferred) = preferred_backend {
        let Some(kind) = BackendKind::parse(preferred) else {
            return Err(LmxError::invalid_param(
                format!("Unknown backend '{preferred}'"),
                "backend",
            ));
        };
        candidates.retain(|c| *c != kind);
        candidates.insert(0, kind);
    }

    if allow_failed {
        return Ok(candidates);
    }

    let filtered: Vec<BackendKind> = candidates
        .iter()
        .copied()
        .filter(|kind| {
            registry.latest_outcome(model_id, kind.as_str()) != Some(CompatOutcome::Fail)
        })
        .collect();

    // Surface a best-effort candidate rather than an empty list.
    if filtered.is_empty() {
        Ok(candidates)
    } else {
        Ok(filtered)
    }
}

fn is_gguf_model(model_id: &str) -> bool {
    let lower = model_id.to_ascii_lowercase();
    lower.ends_with(".gguf") || lower.contains("gguf")
}
