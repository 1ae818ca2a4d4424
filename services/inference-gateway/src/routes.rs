use axum::{
    extract::{
        multipart::MultipartRejection, rejection::JsonRejection, DefaultBodyLimit, Multipart, OriginalUri, Path, Query, State,
    },
    http::{Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use gateway_core::{mark_ready, probe_routes};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};

use crate::artifacts::UploadedFile;
use crate::auth::auth_middleware;
use crate::dispatch::ResponseEnvelope;
use crate::error::GatewayError;
use crate::registry::{Acquisition, Modality, ModelSet};
use crate::state::AppState;
use crate::upload::{collect_images, IMAGE_FIELD, IMAGES_FIELD};

pub fn create_app(state: AppState) -> Router {
    let server = &state.config.server;
    let upload_limit = server.upload_body_limit_bytes;

    let api = Router::new()
        .route("/text/classify/text", post(classify_text))
        .route("/text/classify/text/batch", post(classify_text_batch))
        .route("/image/classify/image", post(classify_image).layer(DefaultBodyLimit::max(upload_limit)))
        .route("/image/classify/image/batch", post(classify_image_batch).layer(DefaultBodyLimit::max(upload_limit)))
        .route("/models/:modality/initialize", post(initialize_model))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let mut app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/models/info", get(models_info))
        .route("/examples", get(examples))
        .nest("/api", api)
        .merge(probe_routes())
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(server.json_body_limit_bytes))
        .layer(TraceLayer::new_for_http());
    if server.cors_enabled {
        app = app.layer(CorsLayer::permissive());
    }
    app.with_state(state)
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn json_body(body: Result<Json<Value>, JsonRejection>) -> Result<Value, GatewayError> {
    match body {
        Ok(Json(v)) => Ok(v),
        // No JSON at all reads as an empty body; the dispatcher names the missing field.
        Err(JsonRejection::MissingJsonContentType(_)) => Ok(Value::Null),
        Err(e) => Err(GatewayError::invalid(format!("Invalid JSON body: {}", e.body_text()))),
    }
}

async fn uploads(
    state: &AppState,
    multipart: Result<Multipart, MultipartRejection>,
    field: &str,
    max_files: usize,
) -> Result<Vec<UploadedFile>, GatewayError> {
    match multipart {
        Ok(m) => collect_images(m, field, max_files, state.config.uploads.max_file_bytes).await,
        Err(e) => {
            debug!(error = %e.body_text(), "request carries no multipart body");
            Ok(Vec::new())
        }
    }
}

async fn classify_text(State(state): State<AppState>, body: Result<Json<Value>, JsonRejection>) -> Result<Json<ResponseEnvelope>, GatewayError> {
    let body = json_body(body)?;
    Ok(Json(state.dispatcher.classify_text(&body).await?))
}

async fn classify_text_batch(State(state): State<AppState>, body: Result<Json<Value>, JsonRejection>) -> Result<Json<ResponseEnvelope>, GatewayError> {
    let body = json_body(body)?;
    Ok(Json(state.dispatcher.classify_text_batch(&body).await?))
}

async fn classify_image(State(state): State<AppState>, multipart: Result<Multipart, MultipartRejection>) -> Result<Json<ResponseEnvelope>, GatewayError> {
    let files = uploads(&state, multipart, IMAGE_FIELD, 1).await?;
    Ok(Json(state.dispatcher.classify_image(files).await?))
}

async fn classify_image_batch(State(state): State<AppState>, multipart: Result<Multipart, MultipartRejection>) -> Result<Json<ResponseEnvelope>, GatewayError> {
    let files = uploads(&state, multipart, IMAGES_FIELD, state.dispatcher.limits().max_image_batch).await?;
    Ok(Json(state.dispatcher.classify_image_batch(files).await?))
}

#[derive(Debug, Deserialize)]
struct InitializeParams {
    /// Block until the acquisition settled.
    #[serde(default)]
    wait: bool,
}

/// Starts (or joins) acquisition for one modality. Ready models answer 200,
/// otherwise 202 unless `?wait=true`.
async fn initialize_model(
    State(state): State<AppState>,
    Path(modality): Path<String>,
    Query(params): Query<InitializeParams>,
) -> Result<Response, GatewayError> {
    let modality = modality.parse::<Modality>().map_err(GatewayError::invalid)?;
    let registry = state.models.get(modality);
    let (acquisition, started) = registry.begin_initialize();
    if started {
        info!(%modality, "model initialization requested");
        tokio::spawn(settle(state.models.clone(), modality, acquisition.clone()));
    }
    if params.wait {
        acquisition
            .await
            .map_err(|e| GatewayError::inference("Model initialization failed", anyhow::anyhow!("{e:#}")))?;
    }
    let snapshot = registry.snapshot();
    let status = if snapshot.loaded { StatusCode::OK } else { StatusCode::ACCEPTED };
    let body = json!({
        "modality": modality,
        "model": registry.descriptor().model_id,
        "task": registry.descriptor().task,
        "loaded": snapshot.loaded,
        "loading": snapshot.loading,
        "timestamp": now_rfc3339(),
    });
    Ok((status, Json(body)).into_response())
}

/// Follow-up once a requested acquisition finished: warm-up and readiness.
async fn settle(models: Arc<ModelSet>, modality: Modality, acquisition: Acquisition) {
    if let Ok(classifier) = acquisition.await {
        models.warmup(modality, classifier.as_ref()).await;
        if models.all_ready() {
            mark_ready();
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "models": {
            "text": state.models.get(Modality::Text).snapshot(),
            "image": state.models.get(Modality::Image).snapshot(),
        },
        "timestamp": now_rfc3339(),
    }))
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "Multi-Modal AI Classification API",
        "version": env!("CARGO_PKG_VERSION"),
        "capabilities": ["text-classification", "image-classification"],
        "endpoints": {
            "health": "GET /health",
            "textClassify": "POST /api/text/classify/text",
            "textBatch": "POST /api/text/classify/text/batch",
            "imageClassify": "POST /api/image/classify/image",
            "imageBatch": "POST /api/image/classify/image/batch",
            "initialize": "POST /api/models/{modality}/initialize",
            "info": "GET /models/info",
            "examples": "GET /examples",
        }
    }))
}

async fn models_info(State(state): State<AppState>) -> Json<Value> {
    let text = state.models.get(Modality::Text);
    let image = state.models.get(Modality::Image);
    let (text_state, image_state) = (text.snapshot(), image.snapshot());
    Json(json!({
        "textClassification": {
            "model": text.descriptor().model_id,
            "task": text.descriptor().task,
            "loaded": text_state.loaded,
            "loading": text_state.loading,
            "labels": ["POSITIVE", "NEGATIVE"],
            "description": "DistilBERT model for sentiment analysis",
        },
        "imageClassification": {
            "model": image.descriptor().model_id,
            "task": image.descriptor().task,
            "loaded": image_state.loaded,
            "loading": image_state.loading,
            "description": "Vision Transformer for general image classification",
            "supportedFormats": ["jpg", "jpeg", "png", "gif", "bmp", "webp"],
        }
    }))
}

async fn examples(State(state): State<AppState>) -> Json<Value> {
    let limits = state.dispatcher.limits();
    Json(json!({
        "textClassification": {
            "single": {
                "endpoint": "POST /api/text/classify/text",
                "body": { "text": "This product is amazing!" },
                "response": {
                    "success": true,
                    "type": "text-classification",
                    "input": "This product is amazing!",
                    "result": { "label": "POSITIVE", "score": 0.9991 }
                }
            },
            "batch": {
                "endpoint": "POST /api/text/classify/text/batch",
                "body": { "texts": ["Great!", "Terrible!"] },
                "note": format!("Maximum {} texts per batch", limits.max_text_batch),
                "response": {
                    "success": true,
                    "type": "text-classification-batch",
                    "count": 2,
                    "results": [
                        { "label": "POSITIVE", "score": 0.9998 },
                        { "label": "NEGATIVE", "score": 0.9994 }
                    ]
                }
            }
        },
        "imageClassification": {
            "single": {
                "endpoint": "POST /api/image/classify/image",
                "method": "multipart/form-data",
                "field": IMAGE_FIELD,
                "response": {
                    "success": true,
                    "type": "image-classification",
                    "filename": "image-1700000000000-123456789.jpg",
                    "result": [
                        { "label": "Egyptian cat", "score": 0.8234 },
                        { "label": "tabby, tabby cat", "score": 0.1543 }
                    ]
                }
            },
            "batch": {
                "endpoint": "POST /api/image/classify/image/batch",
                "method": "multipart/form-data",
                "field": IMAGES_FIELD,
                "note": format!("Maximum {} images per batch", limits.max_image_batch)
            }
        }
    }))
}

async fn not_found(method: Method, OriginalUri(uri): OriginalUri) -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Route not found", "method": method.as_str(), "path": uri.path() })))
}
