use anyhow::{Context, Result};
use gateway_core::{init_tracing, ConfigSources};
use inference_gateway::config::SERVICE_NAME;
use inference_gateway::{serve, spawn_model_initialization, AppState, GatewayConfig};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = GatewayConfig::load(&ConfigSources::from_process()).context("loading configuration")?;
    init_tracing(SERVICE_NAME, &cfg.log_level)?;
    info!(service = SERVICE_NAME, backend = %cfg.backend.endpoint, "starting");
    if cfg.auth.tokens.is_empty() {
        warn!("auth.tokens is empty; classification endpoints are unauthenticated");
    }

    let listener = TcpListener::bind(cfg.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.server.bind_addr))?;
    let state = AppState::with_http_backend(cfg)?;
    spawn_model_initialization(state.models.clone());
    serve(listener, state, shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => { sig.recv().await; }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutting down gracefully");
}
