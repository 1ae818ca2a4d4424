//! Per-modality model registry.
//!
//! Each registry owns one slot: `Uninitialized`, `Loading` (holding the shared
//! in-flight acquisition) or `Ready`. The check-then-set on the slot happens
//! under one lock with no await point, so concurrent callers either start the
//! acquisition or join the one already running. The acquisition runs on its
//! own task and writes the outcome back to the slot itself, so it settles even
//! if every caller has gone away. A failed acquisition returns the slot to
//! `Uninitialized`; nothing retries on its own.

use anyhow::anyhow;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::{Classifier, InferenceBackend, InferenceInput, ModelDescriptor, ProgressEvent, ProgressFn};
use crate::config::ModelsConfig;
use crate::metrics::{MODEL_ACQUIRE_MS, MODEL_READY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self { Modality::Text => "text", Modality::Image => "image" }
    }

    /// Capitalized form used in client-facing messages.
    pub fn title(&self) -> &'static str {
        match self { Modality::Text => "Text", Modality::Image => "Image" }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Modality {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Modality::Text),
            "image" => Ok(Modality::Image),
            other => Err(format!("unknown modality '{other}' (expected text or image)")),
        }
    }
}

pub type AcquireResult = Result<Arc<dyn Classifier>, Arc<anyhow::Error>>;
pub type Acquisition = Shared<BoxFuture<'static, AcquireResult>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    Uninitialized,
    Loading,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelSnapshot {
    pub loaded: bool,
    pub loading: bool,
}

enum Slot {
    Uninitialized,
    Loading(Acquisition),
    Ready(Arc<dyn Classifier>),
}

pub struct ModelRegistry {
    modality: Modality,
    descriptor: ModelDescriptor,
    backend: Arc<dyn InferenceBackend>,
    slot: Arc<Mutex<Slot>>,
}

impl ModelRegistry {
    pub fn new(modality: Modality, descriptor: ModelDescriptor, backend: Arc<dyn InferenceBackend>) -> Self {
        Self { modality, descriptor, backend, slot: Arc::new(Mutex::new(Slot::Uninitialized)) }
    }

    pub fn modality(&self) -> Modality { self.modality }
    pub fn descriptor(&self) -> &ModelDescriptor { &self.descriptor }

    pub fn status(&self) -> ModelStatus {
        match &*self.slot.lock() {
            Slot::Uninitialized => ModelStatus::Uninitialized,
            Slot::Loading(_) => ModelStatus::Loading,
            Slot::Ready(_) => ModelStatus::Ready,
        }
    }

    pub fn snapshot(&self) -> ModelSnapshot {
        let status = self.status();
        ModelSnapshot { loaded: status == ModelStatus::Ready, loading: status == ModelStatus::Loading }
    }

    /// The loaded classifier, without triggering acquisition.
    pub fn instance(&self) -> Option<Arc<dyn Classifier>> {
        match &*self.slot.lock() { Slot::Ready(inst) => Some(inst.clone()), _ => None }
    }

    /// Status and classifier read under one lock.
    pub fn current(&self) -> (ModelStatus, Option<Arc<dyn Classifier>>) {
        match &*self.slot.lock() {
            Slot::Uninitialized => (ModelStatus::Uninitialized, None),
            Slot::Loading(_) => (ModelStatus::Loading, None),
            Slot::Ready(inst) => (ModelStatus::Ready, Some(inst.clone())),
        }
    }

    /// Memoized classifier; the first caller starts the acquisition and every
    /// concurrent caller awaits the same one.
    pub async fn get_instance(&self) -> AcquireResult { self.initialize().await }

    pub fn initialize(&self) -> Acquisition { self.initialize_after(future::ready(())) }

    /// Like [`initialize`](Self::initialize); the flag is true only for the
    /// one caller whose call started the acquisition.
    pub fn begin_initialize(&self) -> (Acquisition, bool) { self.claim(future::ready(())) }

    /// Like [`initialize`](Self::initialize), but the backend is only called
    /// once `prior` resolves. The slot reads `Loading` from this call on.
    /// Requires a tokio runtime.
    pub fn initialize_after<F>(&self, prior: F) -> Acquisition
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.claim(prior).0
    }

    fn claim<F>(&self, prior: F) -> (Acquisition, bool)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.slot.lock();
        match &*slot {
            Slot::Ready(inst) => return (future::ready::<AcquireResult>(Ok(inst.clone())).boxed().shared(), false),
            Slot::Loading(acq) => return (acq.clone(), false),
            Slot::Uninitialized => {}
        }
        let acq = self.spawn_acquisition(prior);
        *slot = Slot::Loading(acq.clone());
        (acq, true)
    }

    fn spawn_acquisition<F>(&self, prior: F) -> Acquisition
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let slot = self.slot.clone();
        let backend = self.backend.clone();
        let descriptor = self.descriptor.clone();
        let modality = self.modality;
        let handle = tokio::spawn(async move {
            prior.await;
            info!(%modality, task = %descriptor.task, model = %descriptor.model_id, "loading model");
            let started = Instant::now();
            let progress: ProgressFn = Arc::new(move |p: ProgressEvent| {
                if p.status == "downloading" {
                    info!(%modality, file = %p.name, progress = p.progress.map(|v| v.round()).unwrap_or(0.0), "model download progress");
                } else {
                    debug!(%modality, status = %p.status, file = %p.name, "model load progress");
                }
            });
            let outcome = AssertUnwindSafe(backend.acquire(&descriptor, Some(progress))).catch_unwind().await;
            let result: AcquireResult = match outcome {
                Ok(Ok(inst)) => Ok(inst),
                Ok(Err(e)) => Err(Arc::new(e)),
                Err(_) => Err(Arc::new(anyhow!("{modality} model acquisition panicked"))),
            };
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            {
                let mut guard = slot.lock();
                match &result {
                    Ok(inst) => {
                        *guard = Slot::Ready(inst.clone());
                        MODEL_READY.with_label_values(&[modality.as_str()]).set(1);
                        MODEL_ACQUIRE_MS.with_label_values(&[modality.as_str(), "ok"]).observe(elapsed_ms);
                        info!(%modality, elapsed_ms, "model loaded");
                    }
                    Err(e) => {
                        *guard = Slot::Uninitialized;
                        MODEL_ACQUIRE_MS.with_label_values(&[modality.as_str(), "error"]).observe(elapsed_ms);
                        error!(%modality, error = %e, "model acquisition failed");
                    }
                }
            }
            result
        });
        async move {
            match handle.await {
                Ok(r) => r,
                Err(e) => Err(Arc::new(anyhow!("model acquisition task aborted: {e}"))),
            }
        }
        .boxed()
        .shared()
    }
}

/// The registries for every modality, owned by the application state.
pub struct ModelSet {
    text: ModelRegistry,
    image: ModelRegistry,
}

impl ModelSet {
    pub fn new(models: &ModelsConfig, backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            text: ModelRegistry::new(Modality::Text, models.text.clone(), backend.clone()),
            image: ModelRegistry::new(Modality::Image, models.image.clone(), backend),
        }
    }

    pub fn get(&self, modality: Modality) -> &ModelRegistry {
        match modality { Modality::Text => &self.text, Modality::Image => &self.image }
    }

    pub fn all_ready(&self) -> bool {
        self.text.status() == ModelStatus::Ready && self.image.status() == ModelStatus::Ready
    }

    /// Startup initialization. Both modalities read `loading` right away; the
    /// backend is called for the image model first and for the text model once
    /// that settled, whatever its outcome. Returns true when both loaded.
    pub async fn initialize_all(&self) -> bool {
        info!("initializing models");
        let image = self.image.initialize();
        let text = self.text.initialize_after(image.clone().map(|_| ()));
        let (image_res, text_res) = future::join(image, text).await;
        if let Ok(classifier) = &text_res {
            self.warmup(Modality::Text, classifier.as_ref()).await;
        }
        let ok = image_res.is_ok() && text_res.is_ok();
        if ok { info!("all models initialized"); } else { warn!("model initialization incomplete; use the initialize endpoint to retry"); }
        ok
    }

    /// Runs the descriptor's warm-up input once; the outcome is only logged.
    pub async fn warmup(&self, modality: Modality, classifier: &dyn Classifier) {
        let Some(input) = self.get(modality).descriptor().warmup_input.clone() else { return };
        match classifier.classify(InferenceInput::Text(input)).await {
            Ok(result) => info!(%modality, ?result, "warm-up classification"),
            Err(e) => warn!(%modality, error = %e, "warm-up classification failed"),
        }
    }
}
