use anyhow::{bail, Result};
use gateway_core::{load_config, ConfigSources};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::backend::ModelDescriptor;

pub const SERVICE_NAME: &str = "inference-gateway";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub log_level: String,
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub backend: BackendConfig,
    pub uploads: UploadConfig,
    pub limits: BatchLimits,
    pub inference: InferenceConfig,
    pub auth: AuthConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            server: ServerConfig::default(),
            models: ModelsConfig::default(),
            backend: BackendConfig::default(),
            uploads: UploadConfig::default(),
            limits: BatchLimits::default(),
            inference: InferenceConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub json_body_limit_bytes: usize,
    /// Whole multipart body, all files of a batch included.
    pub upload_body_limit_bytes: usize,
    pub cors_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            json_body_limit_bytes: 10 * 1024 * 1024,
            upload_body_limit_bytes: 64 * 1024 * 1024,
            cors_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub text: ModelDescriptor,
    pub image: ModelDescriptor,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            text: ModelDescriptor {
                task: "text-classification".into(),
                model_id: "Xenova/distilbert-base-uncased-finetuned-sst-2-english".into(),
                warmup_input: Some("This is a test message".into()),
            },
            image: ModelDescriptor {
                task: "image-classification".into(),
                model_id: "Xenova/vit-base-patch16-224".into(),
                warmup_input: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub endpoint: String,
    pub api_token: Option<String>,
    pub request_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8000".into(),
            api_token: None,
            request_timeout_ms: 30_000,
            acquire_timeout_ms: 600_000,
            poll_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub dir: PathBuf,
    pub cleanup_grace_ms: u64,
    pub max_file_bytes: usize,
}

impl UploadConfig {
    pub fn cleanup_grace(&self) -> Duration { Duration::from_millis(self.cleanup_grace_ms) }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self { dir: PathBuf::from("uploads"), cleanup_grace_ms: 5_000, max_file_bytes: 5 * 1024 * 1024 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchLimits {
    pub max_text_batch: usize,
    pub max_image_batch: usize,
}

impl Default for BatchLimits {
    fn default() -> Self { Self { max_text_batch: 100, max_image_batch: 10 } }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Requests allowed inside an inference call at once; unbounded when unset.
    pub max_concurrent_requests: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Accepted bearer tokens. Empty disables authentication.
    pub tokens: Vec<String>,
}

impl GatewayConfig {
    pub fn load(sources: &ConfigSources) -> Result<Self> {
        let cfg: Self = load_config(SERVICE_NAME, &Self::default(), sources, &["auth.tokens"])?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.limits.max_text_batch == 0 || self.limits.max_image_batch == 0 {
            bail!("batch limits must be at least 1");
        }
        if self.inference.max_concurrent_requests == Some(0) {
            bail!("inference.max_concurrent_requests must be at least 1 when set");
        }
        if self.uploads.max_file_bytes == 0 {
            bail!("uploads.max_file_bytes must be positive");
        }
        if self.backend.poll_interval_ms == 0 {
            bail!("backend.poll_interval_ms must be positive");
        }
        Ok(())
    }
}
