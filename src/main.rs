use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

mod agents;
mod api;
mod backends;
mod concurrency;
mod config;
mod download;
mod error;
mod events;
mod inference;
mod memory;
mod policy;
mod registry;
mod runtime_state;

pub use config::Config;
pub use error::LmxError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a container HEALTHCHECK, hit /healthz and exit
    // immediately. This avoids needing curl/wget in the image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "opta_lmx=info,tower_http=warn".into()),
        )
        .init();

    // Load config
    let config_path = std::env::var("OPTA_LMX_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            Config::default().state_dir().join("config.toml")
        });

    let config = if config_path.is_file() {
        Config::load(&config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        info!(path = %config_path.display(), "no config file — using defaults");
        Config::default()
    };

    let state_dir = config.state_dir();
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("creating state dir {}", state_dir.display()))?;

    info!(
        client_port = config.server.client_port,
        admin_port = config.server.admin_port,
        state_dir = %state_dir.display(),
        "opta-lmx starting"
    );

    // Crash-loop detection and unclean-shutdown restore both read the
    // previous runtime snapshot before anything else starts.
    let runtime_state = Arc::new(runtime_state::RuntimeStateFile::startup(
        state_dir.join("runtime-state.json"),
    ));
    if runtime_state.is_crash_loop() {
        warn!(reason = "skipping auto-load", "crash_loop_detected");
    }

    let bus = events::EventBus::new(256);
    let config = Arc::new(config);

    let engine = Arc::new(inference::InferenceEngine::new(
        &config,
        state_dir.clone(),
        bus.clone(),
    ));

    let run_store = if config.agents.store_backend == "memory" {
        agents::RunStore::memory()
    } else {
        agents::RunStore::file(state_dir.join("agent-runs.jsonl"))
    };
    let agent_runtime = agents::AgentRuntime::start(
        Arc::clone(&engine) as Arc<dyn agents::RunEngine>,
        config.agents.clone(),
        run_store,
        bus.clone(),
    );

    let cache_dir = config
        .downloads
        .cache_dir
        .clone()
        .unwrap_or_else(|| state_dir.join("models"));
    let downloads = Arc::new(download::DownloadCoordinator::new(
        cache_dir.clone(),
        config.downloads.min_free_disk_gb,
        Arc::new(download::CliFetcher),
    ));

    let state = api::AppState::new(
        Arc::clone(&engine),
        agent_runtime,
        Arc::clone(&downloads),
        Arc::clone(&config),
    );

    // Restore models left loaded by an unclean shutdown (never in a crash
    // loop). Incomplete snapshots are skipped, not retried.
    for model_id in runtime_state.models_to_restore() {
        if !download::is_local_snapshot_complete(&cache_dir, &model_id)
            && !runtime_is_attached(&config, &model_id)
        {
            warn!(model_id, "snapshot_incomplete");
            continue;
        }
        info!(model_id, "restoring model after unclean shutdown");
        if let Err(error) = engine
            .load_model(inference::LoadRequest::new(model_id.clone()))
            .await
        {
            warn!(model_id, %error, "model restore failed");
        }
    }

    // Background loops: runtime-state snapshots and TTL eviction.
    tokio::spawn(snapshot_loop(
        Arc::clone(&runtime_state),
        Arc::clone(&engine),
    ));
    if config.models.default_keep_alive_sec > 0 {
        tokio::spawn(ttl_eviction_loop(
            Arc::clone(&engine),
            config.models.default_keep_alive_sec,
        ));
    }

    // Bind client API and admin API
    let client_addr: SocketAddr = format!("0.0.0.0:{}", config.server.client_port).parse()?;
    let admin_addr: SocketAddr = format!("0.0.0.0:{}", config.server.admin_port).parse()?;

    let client_listener = tokio::net::TcpListener::bind(client_addr).await?;
    let admin_listener = tokio::net::TcpListener::bind(admin_addr).await?;

    info!(%client_addr, "client API listening");
    info!(%admin_addr, "admin API listening");

    // Attach request tracing middleware to both servers
    let trace_layer = || {
        tower_http::trace::TraceLayer::new_for_http()
            .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
            .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO))
    };

    let client_app = api::openai::router(Arc::clone(&state))
        .merge(api::agents::router(Arc::clone(&state)))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer());
    let admin_app = api::admin::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer());

    tokio::select! {
        result = axum::serve(client_listener, client_app) => {
            result.context("client API server error")?;
        }
        result = axum::serve(admin_listener, admin_app) => {
            result.context("admin API server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    // Drain in-flight requests, stop downloads, and record a clean shutdown
    // so the crash-loop detector resets on next startup.
    let drained = engine.drain(Duration::from_secs(30)).await;
    if !drained {
        warn!("drain timed out — shutting down with requests in flight");
    }
    downloads.shutdown();
    let loaded: Vec<String> = engine
        .get_loaded_models()
        .into_iter()
        .map(|m| m.model_id)
        .collect();
    runtime_state.write(loaded, true);
    info!("shutdown complete");

    Ok(())
}

/// Whether the first-preference runtime for this model is attach-mode (its
/// files live behind an external server, not in our cache).
fn runtime_is_attached(config: &Config, _model_id: &str) -> bool {
    config
        .backend_preferences()
        .first()
        .and_then(|kind| config.models.runtimes.get(kind.as_str()))
        .is_some_and(|runtime| runtime.base_url.is_some())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /healthz and exit 0 on 200, 1 otherwise.
/// Invoked via `opta-lmx --healthcheck` from a container HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("OPTA_LMX_CLIENT_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(1234);

    let url = format!("http://127.0.0.1:{port}/healthz");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// Background task: rewrite the runtime-state snapshot every ten seconds so
/// an unclean shutdown can be detected and recovered from.
async fn snapshot_loop(
    runtime_state: Arc<runtime_state::RuntimeStateFile>,
    engine: Arc<inference::InferenceEngine>,
) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(runtime_state::SNAPSHOT_INTERVAL_SEC));
    interval.tick().await;
    loop {
        interval.tick().await;
        let loaded: Vec<String> = engine
            .get_loaded_models()
            .into_iter()
            .map(|m| m.model_id)
            .collect();
        runtime_state.write(loaded, false);
    }
}

/// Background task: evict models idle past their TTL. Per-model
/// `keep_alive_sec` overrides the default; zero pins a model.
async fn ttl_eviction_loop(engine: Arc<inference::InferenceEngine>, default_ttl_sec: u64) {
    let period = Duration::from_secs((default_ttl_sec / 4).clamp(10, 60));
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        let evicted = engine.evict_idle_models(default_ttl_sec).await;
        if !evicted.is_empty() {
            info!(?evicted, "ttl_eviction_sweep");
        }
    }
}
