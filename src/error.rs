//! Unified error type for the serving core and its HTTP surface.
//!
//! [`LmxError`] is the typed taxonomy every subsystem speaks: lifecycle,
//! generation, agents, and downloads all raise it, and axum handlers return
//! `Result<T, LmxError>` and propagate with `?`. [`IntoResponse`] renders the
//! OpenAI-compatible envelope:
//!
//! ```json
//! { "error": { "message": "...", "type": "...", "code": "...", "retry_after": 5 } }
//! ```
//!
//! Anything that doesn't match a known pattern falls through to
//! [`LmxError::Internal`] and a 500.

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Message used whenever a request cannot obtain an inference slot.
///
/// The agent scheduler's transient-retry predicate matches on the
/// `"Server is busy"` prefix, so the wording is part of the contract.
pub const BUSY_MESSAGE: &str =
    "Server is busy — all inference slots occupied. Try again shortly.";

/// Typed error taxonomy for the inference control plane.
#[derive(Debug, thiserror::Error)]
pub enum LmxError {
    /// Malformed input: bad fields, path traversal, unusable parameters.
    #[error("{message}")]
    InvalidRequest {
        message: String,
        param: Option<String>,
    },

    /// A request field the server recognises but does not implement.
    #[error("{message}")]
    NotSupported { message: String },

    /// Model is not in the loaded set.
    #[error("Model '{model_id}' is not loaded")]
    ModelNotFound { model_id: String },

    /// No download task registered under this id.
    #[error("Download '{download_id}' not found")]
    DownloadNotFound { download_id: String },

    /// Confirmation token was never issued or has been consumed.
    #[error("Confirmation token not found")]
    TokenNotFound,

    /// No agent run registered under this id.
    #[error("Run '{run_id}' not found")]
    RunNotFound { run_id: String },

    /// Confirmation token exists but is past its validity window.
    #[error("Confirmation token has expired")]
    TokenExpired,

    /// Another request is already loading this model.
    #[error("Model '{model_id}' is already being loaded by another request")]
    ModelInUse { model_id: String },

    /// Model is quarantined and refuses routing until cleared.
    #[error("Model '{model_id}' is quarantined: {reason}")]
    ModelUnstable { model_id: String, reason: String },

    /// Runtime server did not become ready within the loader timeout.
    #[error("Model '{model_id}' load timed out after {timeout_sec}s")]
    ModelLoadTimeout { model_id: String, timeout_sec: u64 },

    /// Loader child process exited abnormally during bring-up.
    #[error("Loader for '{model_id}' crashed (exit_code={exit_code:?}, signal={signal:?})")]
    ModelLoaderCrashed {
        model_id: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
    },

    /// Out-of-process probe reported failure.
    #[error("Probe for '{model_id}' failed: {reason}")]
    ModelProbeFailed { model_id: String, reason: String },

    /// Post-load canary inference failed; model was quarantined and unloaded.
    #[error("Model '{model_id}' failed canary inference and was quarantined: {reason}")]
    ModelCanaryFailed { model_id: String, reason: String },

    /// Idempotency key reused with a different request fingerprint.
    #[error("Idempotency key '{key}' was already used with a different request")]
    IdempotencyConflict { key: String },

    /// Model's runtime signature is on the blocklist for the selected backend.
    #[error(
        "Model '{model_id}' appears to use unsupported runtime signature '{signature}'. \
         This signature is blocked because it can trigger process-level instability \
         during engine bring-up on this stack ({version_hint}). Use a supported model \
         variant or retry with `allow_unsupported_runtime=true` if you explicitly \
         accept crash risk."
    )]
    UnsupportedBackend {
        model_id: String,
        signature: String,
        version_hint: String,
    },

    /// All inference slots occupied; semaphore acquisition timed out.
    /// The message must stay in sync with [`BUSY_MESSAGE`].
    #[error("Server is busy — all inference slots occupied. Try again shortly.")]
    Busy,

    /// Agent run queue is at capacity.
    #[error("Run queue is full — try again shortly")]
    QueueSaturated,

    /// Admission math rejected the load.
    #[error("{message}")]
    InsufficientMemory { message: String },

    /// Free disk below the configured floor.
    #[error("{message}")]
    InsufficientDisk { message: String },

    /// Backend call exceeded the inference timeout.
    #[error("Inference on '{model_id}' timed out after {timeout_sec}s")]
    InferenceTimedOut { model_id: String, timeout_sec: u64 },

    /// Anything unexpected at the backend layer.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl LmxError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            param: None,
        }
    }

    pub fn invalid_param(message: impl Into<String>, param: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            param: Some(param.into()),
        }
    }

    /// Stable machine-readable error code for the envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request_error",
            Self::NotSupported { .. } => "not_supported",
            Self::ModelNotFound { .. } => "model_not_found",
            Self::DownloadNotFound { .. } => "download_not_found",
            Self::TokenNotFound => "token_not_found",
            Self::RunNotFound { .. } => "not_found",
            Self::TokenExpired => "token_expired",
            Self::ModelInUse { .. } => "model_in_use",
            Self::ModelUnstable { .. } => "model_unstable",
            Self::ModelLoadTimeout { .. } => "model_load_timeout",
            Self::ModelLoaderCrashed { .. } => "model_loader_crashed",
            Self::ModelProbeFailed { .. } => "model_probe_failed",
            Self::ModelCanaryFailed { .. } => "model_canary_failed",
            Self::IdempotencyConflict { .. } => "idempotency_conflict",
            Self::UnsupportedBackend { .. } => "model_unsupported_backend",
            Self::Busy => "rate_limit_exceeded",
            Self::QueueSaturated => "queue_saturated",
            Self::InsufficientMemory { .. } => "insufficient_memory",
            Self::InsufficientDisk { .. } => "insufficient_disk",
            Self::InferenceTimedOut { .. } => "inference_timed_out",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Envelope `type` field, grouped by error class as OpenAI clients expect.
    pub fn error_type(&self) -> &'static str {
        match self.status() {
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => "invalid_request_error",
            StatusCode::NOT_FOUND => "not_found_error",
            StatusCode::CONFLICT | StatusCode::GONE => "conflict_error",
            StatusCode::TOO_MANY_REQUESTS => "rate_limit_error",
            StatusCode::INSUFFICIENT_STORAGE => "capacity_error",
            StatusCode::GATEWAY_TIMEOUT => "timeout_error",
            _ => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } | Self::NotSupported { .. } => StatusCode::BAD_REQUEST,
            Self::ModelNotFound { .. }
            | Self::DownloadNotFound { .. }
            | Self::TokenNotFound
            | Self::RunNotFound { .. } => StatusCode::NOT_FOUND,
            Self::TokenExpired => StatusCode::GONE,
            Self::ModelInUse { .. }
            | Self::ModelUnstable { .. }
            | Self::ModelLoadTimeout { .. }
            | Self::ModelLoaderCrashed { .. }
            | Self::ModelProbeFailed { .. }
            | Self::ModelCanaryFailed { .. }
            | Self::IdempotencyConflict { .. } => StatusCode::CONFLICT,
            Self::UnsupportedBackend { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Busy | Self::QueueSaturated => StatusCode::TOO_MANY_REQUESTS,
            Self::InsufficientMemory { .. } | Self::InsufficientDisk { .. } => {
                StatusCode::INSUFFICIENT_STORAGE
            }
            Self::InferenceTimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Seconds the client should wait before retrying, when applicable.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Busy | Self::QueueSaturated => Some(5),
            _ => None,
        }
    }

    fn param(&self) -> Option<&str> {
        match self {
            Self::InvalidRequest { param, .. } => param.as_deref(),
            _ => None,
        }
    }
}

impl IntoResponse for LmxError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
        } else {
            tracing::warn!(code = self.code(), error = %self, "request rejected");
        }

        let mut body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": self.code(),
            }
        });
        if let Some(param) = self.param() {
            body["error"]["param"] = json!(param);
        }
        if let Some(secs) = self.retry_after() {
            body["error"]["retry_after"] = json!(secs);
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = self.retry_after() {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_expected_statuses() {
        let cases: Vec<(LmxError, StatusCode)> = vec![
            (LmxError::invalid_request("bad"), StatusCode::BAD_REQUEST),
            (
                LmxError::ModelNotFound {
                    model_id: "m".into(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                LmxError::ModelInUse {
                    model_id: "m".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                LmxError::UnsupportedBackend {
                    model_id: "m".into(),
                    signature: "s".into(),
                    version_hint: "v".into(),
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (LmxError::Busy, StatusCode::TOO_MANY_REQUESTS),
            (LmxError::QueueSaturated, StatusCode::TOO_MANY_REQUESTS),
            (
                LmxError::InsufficientMemory {
                    message: "no headroom".into(),
                },
                StatusCode::INSUFFICIENT_STORAGE,
            ),
            (
                LmxError::InferenceTimedOut {
                    model_id: "m".into(),
                    timeout_sec: 120,
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status, "code {}", err.code());
        }
    }

    #[test]
    fn busy_error_carries_retry_after_five() {
        assert_eq!(LmxError::Busy.retry_after(), Some(5));
        assert_eq!(LmxError::QueueSaturated.retry_after(), Some(5));
        assert_eq!(
            LmxError::ModelNotFound {
                model_id: "m".into()
            }
            .retry_after(),
            None
        );
    }

    #[test]
    fn busy_message_matches_retry_predicate() {
        // The agent scheduler retries only when the message contains this prefix.
        assert_eq!(LmxError::Busy.to_string(), BUSY_MESSAGE);
        assert!(BUSY_MESSAGE.contains("Server is busy"));
    }

    #[test]
    fn canary_failure_message_names_the_canary() {
        let err = LmxError::ModelCanaryFailed {
            model_id: "org/model".into(),
            reason: "empty_canary_response".into(),
        };
        assert!(err.to_string().contains("failed canary"));
        assert_eq!(err.code(), "model_canary_failed");
    }

    #[test]
    fn internal_errors_wrap_anyhow_transparently() {
        let err: LmxError = anyhow::anyhow!("backend exploded").into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code(), "internal_error");
        assert!(err.to_string().contains("backend exploded"));
    }
}
