//! HTTP surface: thin axum handlers over the engine, agent runtime, and
//! download coordinator. All routing logic lives in the core modules —
//! handlers only translate HTTP concerns (status codes, SSE framing, JSON
//! envelopes) into calls and back.

pub mod admin;
pub mod agents;
pub mod health;
pub mod openai;
pub mod request_id;

use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::{
    agents::AgentRuntime, config::Config, download::DownloadCoordinator,
    inference::InferenceEngine,
};

/// A pending load-confirmation token issued when a load needs a download the
/// caller has not yet approved.
#[derive(Clone)]
pub struct ConfirmationToken {
    pub model_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Shared application state injected into every handler via
/// [`axum::extract::State`]. Instantiated once at startup — the coordinator
/// object that owns all mutable serving state.
pub struct AppState {
    pub engine: Arc<InferenceEngine>,
    pub agents: Arc<AgentRuntime>,
    pub downloads: Arc<DownloadCoordinator>,
    pub config: Arc<Config>,
    pub started_at: Instant,
    /// Outstanding download-confirmation tokens, keyed by token value.
    pub confirmation_tokens: DashMap<String, ConfirmationToken>,
}

impl AppState {
    pub fn new(
        engine: Arc<InferenceEngine>,
        agents: Arc<AgentRuntime>,
        downloads: Arc<DownloadCoordinator>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            agents,
            downloads,
            config,
            started_at: Instant::now(),
            confirmation_tokens: DashMap::new(),
        })
    }

    pub fn issue_confirmation_token(&self, model_id: &str) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        self.confirmation_tokens.insert(
            token.clone(),
            ConfirmationToken {
                model_id: model_id.to_string(),
                expires_at: Utc::now() + chrono::Duration::minutes(10),
            },
        );
        token
    }

    /// Consume a token: removed on first use, regardless of validity.
    pub fn take_confirmation_token(&self, token: &str) -> Option<ConfirmationToken> {
        self.confirmation_tokens.remove(token).map(|(_, v)| v)
    }
}
