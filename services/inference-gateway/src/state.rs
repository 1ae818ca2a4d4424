use anyhow::Result;
use std::sync::Arc;

use crate::artifacts::ArtifactManager;
use crate::backend::{HttpBackend, InferenceBackend};
use crate::config::GatewayConfig;
use crate::dispatch::Dispatcher;
use crate::registry::ModelSet;

/// Shared handler state; cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub models: Arc<ModelSet>,
    pub artifacts: Arc<ArtifactManager>,
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(config: GatewayConfig, backend: Arc<dyn InferenceBackend>) -> Self {
        let models = Arc::new(ModelSet::new(&config.models, backend));
        let artifacts = Arc::new(ArtifactManager::new(config.uploads.dir.clone(), config.uploads.cleanup_grace()));
        let dispatcher = Arc::new(Dispatcher::new(
            models.clone(),
            artifacts.clone(),
            config.limits,
            config.inference.max_concurrent_requests,
        ));
        Self { config: Arc::new(config), models, artifacts, dispatcher }
    }

    /// State backed by the remote inference server named in `backend`.
    pub fn with_http_backend(config: GatewayConfig) -> Result<Self> {
        let backend = HttpBackend::new(&config.backend)?;
        Ok(Self::new(config, Arc::new(backend)))
    }
}
