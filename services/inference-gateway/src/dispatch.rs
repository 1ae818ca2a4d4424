//! Request dispatcher: validates the request shape, passes the readiness gate,
//! runs inference and shapes the response envelope.
//!
//! Order per request: validation, gate, upload persistence, inference. Nothing
//! touches the file system or the backend for a request that fails an earlier
//! step.

use anyhow::anyhow;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, instrument};

use crate::artifacts::{ArtifactManager, UploadedFile};
use crate::backend::{Classification, ClassificationResult, InferenceInput};
use crate::config::BatchLimits;
use crate::error::GatewayError;
use crate::gate::require_ready;
use crate::metrics::{record_request, INFERENCE_LATENCY_MS};
use crate::registry::{Modality, ModelSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    TextSingle,
    TextBatch,
    ImageSingle,
    ImageBatch,
}

impl RequestKind {
    /// Value of the envelope's `type` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::TextSingle => "text-classification",
            RequestKind::TextBatch => "text-classification-batch",
            RequestKind::ImageSingle => "image-classification",
            RequestKind::ImageBatch => "image-classification-batch",
        }
    }

    pub fn modality(&self) -> Modality {
        match self {
            RequestKind::TextSingle | RequestKind::TextBatch => Modality::Text,
            RequestKind::ImageSingle | RequestKind::ImageBatch => Modality::Image,
        }
    }

    fn arity(&self) -> &'static str {
        match self { RequestKind::TextSingle | RequestKind::ImageSingle => "single", _ => "batch" }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageOutcome {
    pub filename: String,
    pub original_name: String,
    pub size: usize,
    pub result: Classification,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BatchResults {
    Labels(Vec<ClassificationResult>),
    Images(Vec<ImageOutcome>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub success: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Classification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<BatchResults>,
    pub processing_time_ms: u64,
    pub timestamp: String,
}

impl ResponseEnvelope {
    fn new(kind: RequestKind, processing_time_ms: u64) -> Self {
        Self {
            success: true,
            kind: kind.as_str(),
            count: None,
            input: None,
            inputs: None,
            filename: None,
            original_name: None,
            size: None,
            result: None,
            results: None,
            processing_time_ms,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

pub struct Dispatcher {
    models: Arc<ModelSet>,
    artifacts: Arc<ArtifactManager>,
    limits: BatchLimits,
    permits: Option<Arc<Semaphore>>,
}

impl Dispatcher {
    pub fn new(models: Arc<ModelSet>, artifacts: Arc<ArtifactManager>, limits: BatchLimits, max_concurrent: Option<usize>) -> Self {
        Self { models, artifacts, limits, permits: max_concurrent.map(|n| Arc::new(Semaphore::new(n))) }
    }

    pub fn limits(&self) -> BatchLimits { self.limits }

    #[instrument(skip_all, fields(kind = "text-single"))]
    pub async fn classify_text(&self, body: &Value) -> Result<ResponseEnvelope, GatewayError> {
        finish(RequestKind::TextSingle, self.text_single(body).await)
    }

    #[instrument(skip_all, fields(kind = "text-batch"))]
    pub async fn classify_text_batch(&self, body: &Value) -> Result<ResponseEnvelope, GatewayError> {
        finish(RequestKind::TextBatch, self.text_batch(body).await)
    }

    #[instrument(skip_all, fields(kind = "image-single", files = uploads.len()))]
    pub async fn classify_image(&self, uploads: Vec<UploadedFile>) -> Result<ResponseEnvelope, GatewayError> {
        finish(RequestKind::ImageSingle, self.image_single(uploads).await)
    }

    #[instrument(skip_all, fields(kind = "image-batch", files = uploads.len()))]
    pub async fn classify_image_batch(&self, uploads: Vec<UploadedFile>) -> Result<ResponseEnvelope, GatewayError> {
        finish(RequestKind::ImageBatch, self.image_batch(uploads).await)
    }

    async fn text_single(&self, body: &Value) -> Result<ResponseEnvelope, GatewayError> {
        let kind = RequestKind::TextSingle;
        let text = match body.get("text") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => return Err(GatewayError::invalid_with_example("Missing or invalid text field", json!({ "text": "This is a great product!" }))),
        };
        let classifier = require_ready(self.models.get(Modality::Text))?;
        let (result, elapsed_ms) = self.timed(kind, classifier.classify(InferenceInput::Text(text.clone()))).await;
        let result = result.map_err(|e| GatewayError::inference("Text classification failed", e))?;
        let mut env = ResponseEnvelope::new(kind, elapsed_ms);
        env.input = Some(text);
        env.result = Some(result);
        Ok(env)
    }

    async fn text_batch(&self, body: &Value) -> Result<ResponseEnvelope, GatewayError> {
        let kind = RequestKind::TextBatch;
        let items = match body.get("texts") {
            Some(Value::Array(items)) if !items.is_empty() => items,
            _ => {
                return Err(GatewayError::invalid_with_example(
                    "Missing or invalid texts field (must be non-empty array)",
                    json!({ "texts": ["Great product!", "Poor service"] }),
                ))
            }
        };
        if items.len() > self.limits.max_text_batch {
            return Err(GatewayError::invalid(format!("Maximum {} texts allowed per batch", self.limits.max_text_batch)));
        }
        let texts = items
            .iter()
            .map(|v| v.as_str().map(str::to_owned))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| GatewayError::invalid("Every entry of texts must be a string"))?;
        let classifier = require_ready(self.models.get(Modality::Text))?;
        let (output, elapsed_ms) = self.timed(kind, classifier.classify(InferenceInput::Texts(texts.clone()))).await;
        let output = output.map_err(|e| GatewayError::inference("Text batch classification failed", e))?;
        let results = match output {
            Classification::Many(results) if results.len() == texts.len() => results,
            Classification::One(result) if texts.len() == 1 => vec![result],
            other => {
                let got = match &other { Classification::One(_) => 1, Classification::Many(r) => r.len() };
                return Err(GatewayError::inference(
                    "Text batch classification failed",
                    anyhow!("backend returned {got} results for {} inputs", texts.len()),
                ));
            }
        };
        let mut env = ResponseEnvelope::new(kind, elapsed_ms);
        env.count = Some(texts.len());
        env.inputs = Some(texts);
        env.results = Some(BatchResults::Labels(results));
        Ok(env)
    }

    async fn image_single(&self, uploads: Vec<UploadedFile>) -> Result<ResponseEnvelope, GatewayError> {
        let kind = RequestKind::ImageSingle;
        match uploads.len() {
            0 => return Err(GatewayError::invalid_with_note("No image file provided", "Send image as multipart/form-data with field name \"image\"")),
            1 => {}
            _ => return Err(GatewayError::invalid("Exactly one image file is allowed; use the batch endpoint for more")),
        }
        let classifier = require_ready(self.models.get(Modality::Image))?;
        let guard = self.artifacts.ingest(uploads).await?;
        let artifact = &guard.artifacts()[0];
        let (result, elapsed_ms) = self.timed(kind, classifier.classify(InferenceInput::Image(artifact.path.clone()))).await;
        let result = result.map_err(|e| GatewayError::inference("Image classification failed", e))?;
        let mut env = ResponseEnvelope::new(kind, elapsed_ms);
        env.filename = Some(artifact.filename.clone());
        env.original_name = Some(artifact.original_name.clone());
        env.size = Some(artifact.size);
        env.result = Some(result);
        Ok(env)
    }

    async fn image_batch(&self, uploads: Vec<UploadedFile>) -> Result<ResponseEnvelope, GatewayError> {
        let kind = RequestKind::ImageBatch;
        if uploads.is_empty() {
            return Err(GatewayError::invalid_with_note("No image files provided", "Send images as multipart/form-data with field name \"images\""));
        }
        if uploads.len() > self.limits.max_image_batch {
            return Err(GatewayError::invalid(format!("Too many files. Maximum {} files per batch.", self.limits.max_image_batch)));
        }
        let classifier = require_ready(self.models.get(Modality::Image))?;
        let guard = self.artifacts.ingest(uploads).await?;
        // One at a time, in submission order; the first failure drops every result.
        let (outcomes, elapsed_ms) = self
            .timed(kind, async {
                let mut outcomes = Vec::with_capacity(guard.artifacts().len());
                for artifact in guard.artifacts() {
                    let result = classifier.classify(InferenceInput::Image(artifact.path.clone())).await?;
                    outcomes.push(ImageOutcome {
                        filename: artifact.filename.clone(),
                        original_name: artifact.original_name.clone(),
                        size: artifact.size,
                        result,
                    });
                }
                Ok::<_, anyhow::Error>(outcomes)
            })
            .await;
        let outcomes = outcomes.map_err(|e| GatewayError::inference("Image batch classification failed", e))?;
        let mut env = ResponseEnvelope::new(kind, elapsed_ms);
        env.count = Some(outcomes.len());
        env.results = Some(BatchResults::Images(outcomes));
        Ok(env)
    }

    /// Runs `fut` under the concurrency cap and reports its wall-clock time.
    async fn timed<T, F>(&self, kind: RequestKind, fut: F) -> (anyhow::Result<T>, u64)
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let _permit = self.permit().await;
        let started = Instant::now();
        let out = fut.await;
        let elapsed = started.elapsed();
        INFERENCE_LATENCY_MS
            .with_label_values(&[kind.modality().as_str(), kind.arity()])
            .observe(elapsed.as_secs_f64() * 1000.0);
        (out, elapsed.as_millis() as u64)
    }

    async fn permit(&self) -> Option<OwnedSemaphorePermit> {
        match &self.permits {
            Some(sem) => sem.clone().acquire_owned().await.ok(),
            None => None,
        }
    }
}

fn finish(kind: RequestKind, res: Result<ResponseEnvelope, GatewayError>) -> Result<ResponseEnvelope, GatewayError> {
    let modality = kind.modality().as_str();
    match &res {
        Ok(env) => {
            record_request(modality, kind.arity(), "ok");
            debug!(kind = env.kind, processing_time_ms = env.processing_time_ms, "classified");
        }
        Err(e) => {
            record_request(modality, kind.arity(), e.outcome());
            match e {
                GatewayError::InferenceFailure { .. } | GatewayError::Storage(_) => error!(kind = kind.as_str(), error = %e, "classification failed"),
                GatewayError::NotReady(_) => info!(kind = kind.as_str(), reason = %e, "rejected: model not ready"),
                _ => debug!(kind = kind.as_str(), error = %e, "rejected request"),
            }
        }
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Classifier, InferenceBackend, ModelDescriptor, ProgressFn};
    use crate::config::ModelsConfig;
    use async_trait::async_trait;
    use axum::body::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Scripted {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    fn label(text: &str) -> ClassificationResult {
        let negative = text.contains("Bad") || text.contains("Terrible");
        ClassificationResult { label: if negative { "NEGATIVE" } else { "POSITIVE" }.into(), score: 0.99 }
    }

    #[async_trait]
    impl Classifier for Scripted {
        async fn classify(&self, input: InferenceInput) -> anyhow::Result<Classification> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match input {
                InferenceInput::Text(t) => Ok(Classification::One(label(&t))),
                InferenceInput::Texts(ts) => Ok(Classification::Many(ts.iter().map(|t| label(t)).collect())),
                InferenceInput::Image(path) => {
                    if tokio::fs::read(&path).await? == b"corrupt" { anyhow::bail!("cannot decode image"); }
                    Ok(Classification::Many(vec![ClassificationResult { label: "tabby".into(), score: 0.8 }]))
                }
            }
        }
    }

    struct Backend(Arc<Scripted>);

    #[async_trait]
    impl InferenceBackend for Backend {
        async fn acquire(&self, _d: &ModelDescriptor, _p: Option<ProgressFn>) -> anyhow::Result<Arc<dyn Classifier>> {
            Ok(self.0.clone())
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        scripted: Arc<Scripted>,
        artifacts: Arc<ArtifactManager>,
        _tmp: tempfile::TempDir,
    }

    async fn fixture(ready: bool, max_concurrent: Option<usize>) -> Fixture {
        let scripted = Arc::new(Scripted::default());
        let models = Arc::new(ModelSet::new(&ModelsConfig::default(), Arc::new(Backend(scripted.clone()))));
        if ready {
            models.get(Modality::Text).get_instance().await.unwrap();
            models.get(Modality::Image).get_instance().await.unwrap();
        }
        let tmp = tempfile::tempdir().unwrap();
        let artifacts = Arc::new(ArtifactManager::new(tmp.path().join("uploads"), Duration::from_millis(20)));
        let dispatcher = Dispatcher::new(models, artifacts.clone(), BatchLimits::default(), max_concurrent);
        Fixture { dispatcher, scripted, artifacts, _tmp: tmp }
    }

    fn image(name: &str, body: &'static [u8]) -> UploadedFile {
        UploadedFile { field_name: "images".into(), original_name: name.into(), mime_type: "image/jpeg".into(), bytes: Bytes::from_static(body) }
    }

    async fn drained(mgr: &ArtifactManager) {
        for _ in 0..200 {
            if mgr.pending_cleanups() == 0 { return; }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("cleanups still pending");
    }

    #[tokio::test]
    async fn text_single_envelope() {
        let fx = fixture(true, None).await;
        let env = fx.dispatcher.classify_text(&json!({"text": "Great!"})).await.unwrap();
        assert_eq!(env.kind, "text-classification");
        assert_eq!(env.result, Some(Classification::One(ClassificationResult { label: "POSITIVE".into(), score: 0.99 })));
        assert!(env.timestamp.ends_with('Z'));
    }

    #[tokio::test]
    async fn text_single_rejects_non_strings_before_gate() {
        let fx = fixture(false, None).await;
        for body in [json!({}), json!({"text": 42}), json!({"text": ""})] {
            let err = fx.dispatcher.classify_text(&body).await.unwrap_err();
            assert!(matches!(err, GatewayError::InvalidInput { .. }), "{body}");
        }
    }

    #[tokio::test]
    async fn text_batch_preserves_order() {
        let fx = fixture(true, None).await;
        let texts: Vec<String> = (0..100).map(|i| if i % 3 == 0 { format!("Bad {i}") } else { format!("Great {i}") }).collect();
        let env = fx.dispatcher.classify_text_batch(&json!({ "texts": texts })).await.unwrap();
        assert_eq!(env.count, Some(100));
        let Some(BatchResults::Labels(results)) = env.results else { panic!("labels expected") };
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.label, if i % 3 == 0 { "NEGATIVE" } else { "POSITIVE" });
        }
    }

    #[tokio::test]
    async fn oversized_text_batch_never_reaches_backend() {
        let fx = fixture(true, None).await;
        let texts: Vec<String> = (0..101).map(|i| format!("t{i}")).collect();
        let err = fx.dispatcher.classify_text_batch(&json!({ "texts": texts })).await.unwrap_err();
        assert_eq!(err.to_string(), "Maximum 100 texts allowed per batch");
        assert_eq!(fx.scripted.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn text_batch_distinguishes_shape_errors() {
        let fx = fixture(true, None).await;
        let missing = fx.dispatcher.classify_text_batch(&json!({"texts": []})).await.unwrap_err();
        assert!(missing.to_string().contains("must be non-empty array"));
        let mixed = fx.dispatcher.classify_text_batch(&json!({"texts": ["ok", 3]})).await.unwrap_err();
        assert!(mixed.to_string().contains("must be a string"));
    }

    #[tokio::test]
    async fn oversized_image_batch_writes_nothing() {
        let fx = fixture(true, None).await;
        let uploads = (0..11).map(|i| image(&format!("{i}.jpg"), b"px")).collect();
        let err = fx.dispatcher.classify_image_batch(uploads).await.unwrap_err();
        assert_eq!(err.to_string(), "Too many files. Maximum 10 files per batch.");
        assert!(!fx.artifacts.dir().exists());
        assert_eq!(fx.scripted.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn not_ready_rejects_before_touching_disk() {
        let fx = fixture(false, None).await;
        let err = fx.dispatcher.classify_image(vec![image("a.jpg", b"px")]).await.unwrap_err();
        assert_eq!(err.to_string(), "Image model not initialized.");
        assert!(!fx.artifacts.dir().exists());
        let err = fx.dispatcher.classify_text(&json!({"text": "hi"})).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotReady(_)));
    }

    #[tokio::test]
    async fn image_batch_failure_is_atomic_and_releases_all_files() {
        let fx = fixture(true, None).await;
        let uploads = vec![image("1.jpg", b"ok"), image("2.jpg", b"corrupt"), image("3.jpg", b"ok")];
        let err = fx.dispatcher.classify_image_batch(uploads).await.unwrap_err();
        assert!(matches!(err, GatewayError::InferenceFailure { .. }));
        assert!(err.to_string().contains("cannot decode image"));
        assert_eq!(fx.scripted.calls.load(Ordering::SeqCst), 2, "third file is never classified");
        assert_eq!(fx.artifacts.pending_cleanups(), 3);
        drained(&fx.artifacts).await;
        assert_eq!(std::fs::read_dir(fx.artifacts.dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn image_single_reports_file_metadata() {
        let fx = fixture(true, None).await;
        let env = fx.dispatcher.classify_image(vec![image("cat.jpg", b"pixels")]).await.unwrap();
        assert_eq!(env.kind, "image-classification");
        assert_eq!(env.original_name.as_deref(), Some("cat.jpg"));
        assert_eq!(env.size, Some(6));
        assert!(env.filename.unwrap().starts_with("images-"));
        assert_eq!(fx.artifacts.pending_cleanups(), 1);
    }

    #[tokio::test]
    async fn concurrency_cap_serializes_requests() {
        let fx = Arc::new(fixture(true, Some(1)).await);
        let tasks: Vec<_> = (0..6)
            .map(|i| { let fx = fx.clone(); tokio::spawn(async move { fx.dispatcher.classify_text(&json!({"text": format!("Great {i}")})).await }) })
            .collect();
        for t in tasks { t.await.unwrap().unwrap(); }
        assert_eq!(fx.scripted.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn envelope_serializes_camel_case() {
        let mut env = ResponseEnvelope::new(RequestKind::TextBatch, 12);
        env.count = Some(1);
        env.results = Some(BatchResults::Labels(vec![ClassificationResult { label: "POSITIVE".into(), score: 0.5 }]));
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "text-classification-batch");
        assert_eq!(v["processingTimeMs"], 12);
        assert_eq!(v["results"][0]["label"], "POSITIVE");
        assert!(v.get("result").is_none());
    }
}
