//! HTTP gateway for text and image classification.
//!
//! Models are acquired once per modality ([`registry`]), requests are refused
//! until the matching model is ready ([`gate`]), validated and dispatched
//! ([`dispatch`]), and uploaded images live only for the duration of their
//! request ([`artifacts`]).

pub mod artifacts;
pub mod auth;
pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod registry;
pub mod routes;
pub mod state;
pub mod upload;

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use config::GatewayConfig;
pub use routes::create_app;
pub use state::AppState;

use registry::ModelSet;

/// Loads every model in the background and marks the service ready once all
/// of them are available. The listener does not wait for this.
pub fn spawn_model_initialization(models: Arc<ModelSet>) -> JoinHandle<bool> {
    tokio::spawn(async move {
        let ok = models.initialize_all().await;
        if ok {
            gateway_core::mark_ready();
        }
        ok
    })
}

/// Serves the gateway on `listener` until `shutdown` resolves, then removes
/// whatever is left in the upload directory.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let artifacts = state.artifacts.clone();
    let app = create_app(state);
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    gateway_core::clear_ready();
    gateway_core::mark_not_live();
    if let Err(e) = artifacts.purge().await {
        warn!(dir = %artifacts.dir().display(), error = %e, "failed to purge upload directory");
    }
    info!("shutdown complete");
    Ok(())
}
