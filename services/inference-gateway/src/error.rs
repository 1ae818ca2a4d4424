use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

use crate::registry::Modality;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NotReady {
    #[error("{} model is still loading. Please try again in a moment.", .0.title())]
    Loading(Modality),
    #[error("{} model not initialized.", .0.title())]
    Uninitialized(Modality),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed, missing or over-limit request content. Caller-fixable.
    #[error("{message}")]
    InvalidInput { message: String, example: Option<Value>, note: Option<String> },
    #[error(transparent)]
    NotReady(#[from] NotReady),
    /// The backend failed during classification; `cause` keeps its message.
    #[error("{context}: {cause:#}")]
    InferenceFailure { context: String, cause: anyhow::Error },
    #[error("failed to store upload: {0}")]
    Storage(#[from] std::io::Error),
    #[error("{0}")]
    Unauthorized(&'static str),
}

impl GatewayError {
    pub fn invalid(message: impl Into<String>) -> Self {
        GatewayError::InvalidInput { message: message.into(), example: None, note: None }
    }

    pub fn invalid_with_example(message: impl Into<String>, example: Value) -> Self {
        GatewayError::InvalidInput { message: message.into(), example: Some(example), note: None }
    }

    pub fn invalid_with_note(message: impl Into<String>, note: impl Into<String>) -> Self {
        GatewayError::InvalidInput { message: message.into(), example: None, note: Some(note.into()) }
    }

    pub fn inference(context: impl Into<String>, cause: anyhow::Error) -> Self {
        GatewayError::InferenceFailure { context: context.into(), cause }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            GatewayError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::InferenceFailure { .. } | GatewayError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }

    /// Short label for metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            GatewayError::InvalidInput { .. } => "invalid_input",
            GatewayError::NotReady(_) => "not_ready",
            GatewayError::InferenceFailure { .. } => "inference_failure",
            GatewayError::Storage(_) => "storage_failure",
            GatewayError::Unauthorized(_) => "unauthorized",
        }
    }

    fn body(&self) -> Value {
        match self {
            GatewayError::InvalidInput { message, example, note } => {
                let mut body = json!({ "error": message });
                if let Some(example) = example { body["example"] = example.clone(); }
                if let Some(note) = note { body["note"] = json!(note); }
                body
            }
            GatewayError::NotReady(reason) => json!({ "error": reason.to_string() }),
            GatewayError::InferenceFailure { context, cause } => json!({ "error": context, "message": format!("{cause:#}") }),
            GatewayError::Storage(e) => json!({ "error": "Internal server error", "message": e.to_string() }),
            GatewayError::Unauthorized(msg) => json!({ "msg": msg }),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let mut resp = (self.status(), Json(self.body())).into_response();
        if matches!(self, GatewayError::NotReady(_)) {
            resp.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from_static("5"));
        }
        resp
    }
}
