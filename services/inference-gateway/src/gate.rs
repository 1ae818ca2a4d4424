//! Readiness gate: the cheapest check on the request path, run before any
//! upload is persisted or any inference is attempted.

use std::sync::Arc;

use crate::backend::Classifier;
use crate::error::{GatewayError, NotReady};
use crate::registry::{ModelRegistry, ModelStatus};

pub enum Readiness {
    Ready(Arc<dyn Classifier>),
    Loading,
    Uninitialized,
}

pub fn check_ready(registry: &ModelRegistry) -> Readiness {
    match registry.current() {
        (_, Some(inst)) => Readiness::Ready(inst),
        (ModelStatus::Loading, None) => Readiness::Loading,
        (_, None) => Readiness::Uninitialized,
    }
}

/// The classifier to dispatch to, or the retryable `NotReady` rejection.
pub fn require_ready(registry: &ModelRegistry) -> Result<Arc<dyn Classifier>, GatewayError> {
    match check_ready(registry) {
        Readiness::Ready(inst) => Ok(inst),
        Readiness::Loading => Err(GatewayError::NotReady(NotReady::Loading(registry.modality()))),
        Readiness::Uninitialized => Err(GatewayError::NotReady(NotReady::Uninitialized(registry.modality()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InferenceBackend, ModelDescriptor, ProgressFn};
    use crate::registry::Modality;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    struct NeverReady(Arc<Notify>);

    #[async_trait]
    impl InferenceBackend for NeverReady {
        async fn acquire(&self, _d: &ModelDescriptor, _p: Option<ProgressFn>) -> anyhow::Result<Arc<dyn Classifier>> {
            self.0.notified().await;
            anyhow::bail!("gave up")
        }
    }

    #[tokio::test]
    async fn distinguishes_loading_from_uninitialized() {
        let release = Arc::new(Notify::new());
        let d = ModelDescriptor { task: "image-classification".into(), model_id: "m".into(), warmup_input: None };
        let reg = ModelRegistry::new(Modality::Image, d, Arc::new(NeverReady(release.clone())));
        let err = require_ready(&reg).err().unwrap();
        assert_eq!(err.to_string(), "Image model not initialized.");
        let acq = reg.initialize();
        let err = require_ready(&reg).err().unwrap();
        assert_eq!(err.to_string(), "Image model is still loading. Please try again in a moment.");
        release.notify_one();
        assert!(acq.await.is_err());
        assert!(matches!(check_ready(&reg), Readiness::Uninitialized));
    }
}
