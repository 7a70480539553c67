//! Main Entrypoint for the Casa API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing the upstream connector, the device backend and the
//!    resilience executors guarding them.
//! 3. Starting the session eviction sweep.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use casa_api::{
    admin::Admin,
    config::{Config, DeviceBackendKind},
    resilience::ResilienceExecutor,
    router::create_router,
    state::{AppState, SessionSettings},
    ws::{
        provider::gemini::GeminiConnector,
        registry::ConnectionRegistry,
        session_state::{EvictionPolicy, SessionStore, spawn_eviction_sweep},
    },
};
use casa_core::device_backend::{DeviceBackend, HomeAssistantBackend, MockDeviceBackend};
use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

const DEFAULT_SYSTEM_PROMPT: &str = "You are Casa, a friendly voice assistant for a smart home. \
Keep answers short and conversational. Use the available device actions to control lights, \
switches, climate, covers, locks and scenes, and confirm what you did.";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const OUTBOUND_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// Loads `system_prompt.md` from the prompts directory, if present.
fn load_system_prompt(prompts_path: &Path) -> anyhow::Result<String> {
    let path = prompts_path.join("system_prompt.md");
    if !path.is_file() {
        warn!(path = %path.display(), "No system prompt file found, using the built-in prompt.");
        return Ok(DEFAULT_SYSTEM_PROMPT.to_string());
    }
    std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 2. Initialize Shared Services ---
    let system_prompt = Arc::new(load_system_prompt(&config.prompts_path)?);

    let device_backend: Arc<dyn DeviceBackend> = match &config.device_backend {
        DeviceBackendKind::HomeAssistant { url, token } => {
            info!(%url, "Using Home Assistant device backend.");
            Arc::new(
                HomeAssistantBackend::new(url, token.clone(), config.call_timeout)
                    .context("Failed to build the Home Assistant client")?,
            )
        }
        DeviceBackendKind::Mock => {
            warn!("Using the mock device backend; no devices will be controlled.");
            Arc::new(MockDeviceBackend)
        }
    };

    let connector = Arc::new(GeminiConnector::new(
        config.gemini_api_key.clone(),
        config.gemini_model.clone(),
        HANDSHAKE_TIMEOUT,
    ));

    let executor = |name: &str| {
        Arc::new(ResilienceExecutor::new(
            name,
            config.retry.clone(),
            config.circuit.clone(),
            config.call_timeout,
        ))
    };

    let app_state = Arc::new(AppState {
        settings: SessionSettings::from_config(&config),
        registry: Arc::new(ConnectionRegistry::new(
            config.outbound_queue_capacity,
            OUTBOUND_SEND_TIMEOUT,
        )),
        sessions: Arc::new(SessionStore::new()),
        upstream_executor: executor("upstream"),
        device_executor: executor("device"),
        connector,
        device_backend,
        system_prompt,
    });

    // --- 3. Start the Eviction Sweep ---
    let shutdown = CancellationToken::new();
    let sweep = spawn_eviction_sweep(
        app_state.sessions.clone(),
        app_state.registry.clone(),
        EvictionPolicy {
            max_age: config.session_max_age,
            max_idle: config.session_max_idle,
            interval: config.sweep_interval,
            metadata_retention: config.metadata_retention,
        },
        shutdown.clone(),
    );

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // --- 5. Start Server ---
    info!(
        model = %config.gemini_model,
        bind_address = %config.bind_address,
        audio_policy = ?config.audio_policy,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    shutdown.cancel();
    if let Err(e) = sweep.await {
        warn!(error = %e, "Eviction sweep task ended abnormally.");
    }

    let report = Admin::new(app_state).report();
    match serde_json::to_string(&report) {
        Ok(json) => info!(report = %json, "Final health report."),
        Err(e) => warn!(error = %e, "Could not serialize the final health report."),
    }

    info!("Server has shut down.");
    Ok(())
}
