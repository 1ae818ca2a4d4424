#![allow(dead_code)]

use async_trait::async_trait;
use inference_gateway::backend::{Classification, ClassificationResult, Classifier, InferenceBackend, InferenceInput, ModelDescriptor, ProgressFn};
use inference_gateway::registry::Modality;
use inference_gateway::{serve, AppState, GatewayConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

/// Labels text by keyword and images by content: a file whose bytes are
/// `corrupt` fails to classify.
#[derive(Default)]
pub struct ScriptedClassifier {
    pub calls: AtomicUsize,
}

fn label(text: &str) -> ClassificationResult {
    let lower = text.to_lowercase();
    if lower.contains("terrible") || lower.contains("bad") || lower.contains("poor") {
        ClassificationResult { label: "NEGATIVE".into(), score: 0.98 }
    } else {
        ClassificationResult { label: "POSITIVE".into(), score: 0.99 }
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, input: InferenceInput) -> anyhow::Result<Classification> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match input {
            InferenceInput::Text(t) => Ok(Classification::One(label(&t))),
            InferenceInput::Texts(ts) => Ok(Classification::Many(ts.iter().map(|t| label(t)).collect())),
            InferenceInput::Image(path) => {
                let bytes = tokio::fs::read(&path).await?;
                if bytes == b"corrupt" {
                    anyhow::bail!("unsupported image format");
                }
                Ok(Classification::Many(vec![
                    ClassificationResult { label: "Egyptian cat".into(), score: 0.82 },
                    ClassificationResult { label: "tabby, tabby cat".into(), score: 0.15 },
                ]))
            }
        }
    }
}

/// Backend whose acquisitions can be held back and made to fail.
pub struct ScriptedBackend {
    pub classifier: Arc<ScriptedClassifier>,
    pub acquisitions: AtomicUsize,
    failures_left: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedBackend {
    pub fn ready() -> Arc<Self> {
        Arc::new(Self { classifier: Arc::default(), acquisitions: AtomicUsize::new(0), failures_left: AtomicUsize::new(0), gate: None })
    }

    /// Acquisitions block until `release` is called on the returned gate.
    pub fn gated() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let backend = Arc::new(Self {
            classifier: Arc::default(),
            acquisitions: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            gate: Some(gate.clone()),
        });
        (backend, gate)
    }

    pub fn failing_first(n: usize) -> Arc<Self> {
        Arc::new(Self { classifier: Arc::default(), acquisitions: AtomicUsize::new(0), failures_left: AtomicUsize::new(n), gate: None })
    }

    pub fn classify_calls(&self) -> usize {
        self.classifier.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn acquire(&self, _descriptor: &ModelDescriptor, _on_progress: Option<ProgressFn>) -> anyhow::Result<Arc<dyn Classifier>> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await?;
        }
        let failing = self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok();
        if failing {
            anyhow::bail!("model download interrupted");
        }
        Ok(self.classifier.clone())
    }
}

pub struct TestGateway {
    pub base: String,
    pub addr: SocketAddr,
    pub client: reqwest::Client,
    pub state: AppState,
    pub backend: Arc<ScriptedBackend>,
    pub upload_dir: PathBuf,
    _tmp: tempfile::TempDir,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Loads both models and waits for them.
    pub async fn load_models(&self) {
        for m in [Modality::Image, Modality::Text] {
            self.state.models.get(m).get_instance().await.expect("model loads");
        }
    }

    pub async fn wait_until<F: Fn(&Self) -> bool>(&self, cond: F) {
        for _ in 0..300 {
            if cond(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    pub fn upload_dir_entries(&self) -> usize {
        std::fs::read_dir(&self.upload_dir).map(|d| d.count()).unwrap_or(0)
    }
}

pub fn test_config(tmp: &tempfile::TempDir) -> GatewayConfig {
    let mut cfg = GatewayConfig::default();
    cfg.uploads.dir = tmp.path().join("uploads");
    cfg.uploads.cleanup_grace_ms = 50;
    cfg.server.bind_addr = SocketAddr::from(([127, 0, 0, 1], 0));
    cfg
}

pub async fn start(backend: Arc<ScriptedBackend>) -> TestGateway {
    start_with(backend, |_| {}).await
}

pub async fn start_with(backend: Arc<ScriptedBackend>, tweak: impl FnOnce(&mut GatewayConfig)) -> TestGateway {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut cfg = test_config(&tmp);
    tweak(&mut cfg);
    let upload_dir = cfg.uploads.dir.clone();
    let state = AppState::new(cfg, backend.clone());
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(serve(listener, state.clone(), std::future::pending()));
    TestGateway {
        base: format!("http://{addr}"),
        addr,
        client: reqwest::Client::new(),
        state,
        backend,
        upload_dir,
        _tmp: tmp,
    }
}

pub fn image_part(name: &str, bytes: &'static [u8]) -> reqwest::multipart::Part {
    reqwest::multipart::Part::bytes(bytes).file_name(name.to_string()).mime_str("image/jpeg").expect("mime")
}
