//! Core shared utilities for the gateway services: tracing setup, layered
//! configuration, and the liveness/readiness/metrics probes.

use anyhow::Result;
use axum::{http::{header, StatusCode}, response::{IntoResponse, Response}, routing::get, Json, Router};
use once_cell::sync::OnceCell;
use prometheus::{Encoder, TextEncoder};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const CONFIG_FILE_ENV: &str = "GATEWAY_CONFIG_FILE";
pub const ENV_PREFIX: &str = "GATEWAY";
const JSON_LOG_ENV: &str = "GATEWAY_JSON_LOG";

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn mark_not_live() { NODE_LIVENESS.store(false, Ordering::SeqCst); }
pub fn is_ready() -> bool { NODE_READINESS.load(Ordering::SeqCst) }
pub fn is_live() -> bool { NODE_LIVENESS.load(Ordering::SeqCst) }

/// Installs the global subscriber once. `RUST_LOG` wins over `default_level`;
/// `GATEWAY_JSON_LOG=1` switches to flattened JSON lines.
pub fn init_tracing(service: &str, default_level: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        let json = std::env::var(JSON_LOG_ENV).ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry
                .with(tracing_subscriber::fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false))
                .try_init()?;
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true))
                .try_init()?;
        }
        Ok(())
    })?;
    info!(service, "tracing initialized");
    Ok(())
}

/// Where configuration is read from besides the serde defaults.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    pub file: Option<PathBuf>,
    /// Overrides the process environment (tests).
    pub env: Option<HashMap<String, String>>,
}

impl ConfigSources {
    pub fn from_process() -> Self {
        Self { file: std::env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from), env: None }
    }
}

/// Layered config: `defaults`, then the optional file, then
/// `GATEWAY__SECTION__KEY` variables. `list_keys` are split on commas.
/// Layers merge per key, so a file may override one nested field only.
pub fn load_config<T: Serialize + DeserializeOwned>(service: &str, defaults: &T, sources: &ConfigSources, list_keys: &[&str]) -> Result<T> {
    let mut builder = config::Config::builder()
        .set_default("service_name", service)?
        .add_source(config::Config::try_from(defaults)?);
    if let Some(file) = &sources.file {
        builder = builder.add_source(config::File::from(file.as_path()).required(false));
    }
    let mut env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
        .source(sources.env.clone());
    if !list_keys.is_empty() {
        env = env.list_separator(",");
        for key in list_keys { env = env.with_list_parse_key(key); }
    }
    let cfg = builder.add_source(env).build()?;
    Ok(cfg.try_deserialize()?)
}

/// Probe endpoints mounted into a service router.
pub fn probe_routes<S: Clone + Send + Sync + 'static>() -> Router<S> {
    Router::new()
        .route("/live", get(|| async { Json(serde_json::json!({"live": is_live()})) }))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
}

async fn ready_handler() -> Response {
    let ready = is_ready();
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(serde_json::json!({"ready": ready}))).into_response()
}

/// Prometheus text exposition of the default registry.
pub fn render_metrics() -> Result<String> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buf)?;
    Ok(String::from_utf8(buf)?)
}

async fn metrics_handler() -> Response {
    match render_metrics() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response(),
    }
}
