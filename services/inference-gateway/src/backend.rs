//! Inference backend adapter: the opaque capability the registry asks for a
//! classifier, plus the HTTP adapter used against a remote inference server.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

use crate::config::BackendConfig;

/// Which inference capability to load for a modality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub task: String,
    pub model_id: String,
    /// Classified once right after loading; the result is only logged.
    #[serde(default)]
    pub warmup_input: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub label: String,
    pub score: f64,
}

/// What a classifier returns: a single result or an ordered list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Classification {
    One(ClassificationResult),
    Many(Vec<ClassificationResult>),
}

impl Classification {
    /// Normalizes a backend payload. Lists of lists carry top-k per input:
    /// a single input keeps its inner list, a batch keeps the top entry of each.
    pub fn from_value(value: Value, batch: bool) -> Result<Self> {
        if let Ok(c) = serde_json::from_value::<Classification>(value.clone()) {
            return Ok(c);
        }
        let nested: Vec<Vec<ClassificationResult>> =
            serde_json::from_value(value).context("unrecognized classification payload")?;
        if batch {
            let tops = nested
                .into_iter()
                .map(|mut ranked| if ranked.is_empty() { Err(anyhow!("empty result list for an input")) } else { Ok(ranked.swap_remove(0)) })
                .collect::<Result<Vec<_>>>()?;
            return Ok(Classification::Many(tops));
        }
        match nested.into_iter().next() {
            Some(ranked) => Ok(Classification::Many(ranked)),
            None => bail!("empty classification payload"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum InferenceInput {
    Text(String),
    Texts(Vec<String>),
    Image(PathBuf),
}

impl InferenceInput {
    fn is_batch(&self) -> bool { matches!(self, InferenceInput::Texts(_)) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub status: String,
    pub name: String,
    pub progress: Option<f64>,
}

pub type ProgressFn = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// A loaded model. Implementations may be called concurrently by distinct requests.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, input: InferenceInput) -> Result<Classification>;
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn acquire(&self, descriptor: &ModelDescriptor, on_progress: Option<ProgressFn>) -> Result<Arc<dyn Classifier>>;
}

/// Status document served by the remote inference server for one model.
#[derive(Debug, Clone, Deserialize)]
struct RemoteModelStatus {
    #[serde(default)]
    loaded: bool,
    #[serde(default)]
    status: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    endpoint: String,
    api_token: Option<String>,
    poll_interval: Duration,
    acquire_timeout: Duration,
}

impl fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpBackend").field("endpoint", &self.endpoint).finish_non_exhaustive()
    }
}

impl HttpBackend {
    pub fn new(cfg: &BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .context("building inference backend client")?;
        Ok(Self {
            client,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            api_token: cfg.api_token.clone(),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            acquire_timeout: Duration::from_millis(cfg.acquire_timeout_ms),
        })
    }

    fn model_url(&self, model_id: &str) -> String { format!("{}/models/{}", self.endpoint, model_id) }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token { Some(t) => req.header(AUTHORIZATION, format!("Bearer {t}")), None => req }
    }
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    #[instrument(skip(self, on_progress), fields(task = %descriptor.task, model = %descriptor.model_id))]
    async fn acquire(&self, descriptor: &ModelDescriptor, on_progress: Option<ProgressFn>) -> Result<Arc<dyn Classifier>> {
        let url = self.model_url(&descriptor.model_id);
        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            let status: RemoteModelStatus = self
                .authorize(self.client.get(&url).query(&[("task", descriptor.task.as_str())]))
                .send()
                .await
                .with_context(|| format!("polling model status at {url}"))?
                .error_for_status()?
                .json()
                .await
                .context("decoding model status")?;
            if let Some(cb) = &on_progress {
                cb(ProgressEvent {
                    status: status.status.clone(),
                    name: status.name.clone().unwrap_or_else(|| descriptor.model_id.clone()),
                    progress: status.progress,
                });
            }
            if status.loaded {
                return Ok(Arc::new(HttpClassifier { backend: self.clone(), url }));
            }
            if status.status == "error" {
                bail!("backend failed to load {}: {}", descriptor.model_id, status.error.unwrap_or_else(|| "unknown error".into()));
            }
            if Instant::now() >= deadline {
                bail!("model {} not loaded after {:?}", descriptor.model_id, self.acquire_timeout);
            }
            debug!(status = %status.status, progress = ?status.progress, "model not loaded yet");
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

struct HttpClassifier {
    backend: HttpBackend,
    url: String,
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, input: InferenceInput) -> Result<Classification> {
        let batch = input.is_batch();
        let req = match input {
            InferenceInput::Text(text) => self.backend.client.post(&self.url).json(&serde_json::json!({ "inputs": text })),
            InferenceInput::Texts(texts) => self.backend.client.post(&self.url).json(&serde_json::json!({ "inputs": texts })),
            InferenceInput::Image(path) => {
                let bytes = tokio::fs::read(&path).await.with_context(|| format!("reading {}", path.display()))?;
                self.backend.client.post(&self.url).header(CONTENT_TYPE, "application/octet-stream").body(bytes)
            }
        };
        let resp = self.backend.authorize(req).send().await.context("inference request")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("inference backend returned {status}: {body}");
        }
        let value: Value = resp.json().await.context("decoding inference response")?;
        Classification::from_value(value, batch)
    }
}
