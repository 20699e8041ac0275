mod handlers;
mod metrics;
mod routes;

use anyhow::Context;
use assay_common::config::{EngineSettings, LogFormat};
use assay_engine::sandbox::SandboxFactory;
use assay_engine::{AdmissionGate, LanguageRegistry, Orchestrator};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub gate: AdmissionGate,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = EngineSettings::from_env();
    init_tracing(settings.log_format);

    info!("Assay API booting...");

    let registry = LanguageRegistry::load_or_builtin(&settings.languages_path)
        .context("Failed to load language registry")?;
    info!(languages = ?registry.list_supported(), "Language registry ready");

    let sandbox = SandboxFactory::from_settings(&settings)?;
    info!(backend = sandbox.name(), "Sandbox backend ready");

    let gate = AdmissionGate::new(settings.max_concurrent_runs);
    info!(
        max_concurrent_runs = gate.capacity(),
        max_parallel_cases = settings.max_parallel_cases,
        request_deadline_ms = settings.request_deadline_ms,
        "Admission gate configured"
    );

    let bind_addr = settings.bind_addr;
    let state = Arc::new(AppState {
        orchestrator: Orchestrator::new(Arc::new(registry), sandbox, gate.clone(), settings),
        gate,
    });

    let app = routes::routes().with_state(state);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;
    info!("HTTP server listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Assay API stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    warn!("Received shutdown signal, finishing in-flight requests...");
}
