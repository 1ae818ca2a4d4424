//! Transient artifact manager: persists uploaded files for the duration of one
//! request and reclaims them afterwards, whatever the request's outcome.
//!
//! [`ArtifactManager::ingest`] hands back an [`ArtifactGuard`]. Dropping the
//! guard schedules deletion of every file it owns after the configured grace
//! period, so early returns, errors and panics all release storage.

use axum::body::Bytes;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::metrics::{CLEANUP_DELETED, CLEANUP_FAILURES};

const MAX_NAME_ATTEMPTS: usize = 4;

/// One file as delivered by the multipart layer, not yet on disk.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub field_name: String,
    pub original_name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

#[derive(Debug, Clone)]
pub struct TransientArtifact {
    pub path: PathBuf,
    pub filename: String,
    pub field_name: String,
    pub original_name: String,
    pub mime_type: String,
    pub size: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ArtifactManager {
    dir: PathBuf,
    grace: Duration,
    pending: Arc<AtomicUsize>,
}

impl ArtifactManager {
    pub fn new(dir: impl Into<PathBuf>, grace: Duration) -> Self {
        Self { dir: dir.into(), grace, pending: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn dir(&self) -> &Path { &self.dir }
    pub fn grace(&self) -> Duration { self.grace }

    /// Deletions scheduled but not yet carried out.
    pub fn pending_cleanups(&self) -> usize { self.pending.load(Ordering::SeqCst) }

    /// Writes `uploads` into the upload directory (created on demand) in order.
    /// Each file belongs to the returned guard from before it is created, so
    /// a failed or cancelled ingest still releases everything it touched.
    pub async fn ingest(self: &Arc<Self>, uploads: Vec<UploadedFile>) -> io::Result<ArtifactGuard> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut guard = ArtifactGuard { manager: self.clone(), artifacts: Vec::with_capacity(uploads.len()) };
        for upload in uploads {
            let mut file = self.create_unique(&mut guard, &upload).await?;
            write_all(&mut file, &upload.bytes).await?;
            debug!(original = %upload.original_name, size = upload.bytes.len(), "upload stored");
        }
        Ok(guard)
    }

    /// Reserves a fresh name in `guard`, then creates the file. A name taken
    /// by someone else is given back and another one tried.
    async fn create_unique(&self, guard: &mut ArtifactGuard, upload: &UploadedFile) -> io::Result<tokio::fs::File> {
        let mut last_err = None;
        for _ in 0..MAX_NAME_ATTEMPTS {
            let filename = unique_filename(&upload.field_name, &upload.original_name);
            let path = self.dir.join(&filename);
            guard.artifacts.push(TransientArtifact {
                path: path.clone(),
                filename,
                field_name: upload.field_name.clone(),
                original_name: upload.original_name.clone(),
                mime_type: upload.mime_type.clone(),
                size: upload.bytes.len(),
                created_at: Utc::now(),
            });
            match tokio::fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(file) => return Ok(file),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    guard.artifacts.pop();
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::AlreadyExists, "could not pick a unique upload name")))
    }

    /// Deletes `path` once the grace period elapsed. A missing file is a no-op
    /// and failures are only logged. Without a runtime the file is removed now.
    pub fn schedule_cleanup(&self, path: PathBuf) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                self.pending.fetch_add(1, Ordering::SeqCst);
                let pending = self.pending.clone();
                let grace = self.grace;
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    remove_artifact(&path).await;
                    pending.fetch_sub(1, Ordering::SeqCst);
                });
            }
            Err(_) => remove_artifact_now(&path),
        }
    }

    /// Removes the whole upload directory (shutdown).
    pub async fn purge(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

async fn write_all(file: &mut tokio::fs::File, bytes: &[u8]) -> io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await
}

async fn remove_artifact(path: &Path) {
    record_removal(path, tokio::fs::remove_file(path).await);
}

fn remove_artifact_now(path: &Path) {
    record_removal(path, std::fs::remove_file(path));
}

fn record_removal(path: &Path, res: io::Result<()>) {
    match res {
        Ok(()) => {
            CLEANUP_DELETED.inc();
            debug!(path = %path.display(), "artifact deleted");
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => debug!(path = %path.display(), "artifact already gone"),
        Err(e) => {
            CLEANUP_FAILURES.inc();
            warn!(path = %path.display(), error = %e, "artifact cleanup failed");
        }
    }
}

/// `<field>-<unix millis>-<random>.<ext>`; the extension is kept only when it
/// is short and alphanumeric.
fn unique_filename(field_name: &str, original_name: &str) -> String {
    let ext = Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 10 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();
    let field: String = field_name.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '_').collect();
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000_000);
    format!("{}-{}-{}{}", if field.is_empty() { "file" } else { &field }, Utc::now().timestamp_millis(), suffix, ext)
}

/// Owns the artifacts of one request; releases them on drop.
#[derive(Debug)]
pub struct ArtifactGuard {
    manager: Arc<ArtifactManager>,
    artifacts: Vec<TransientArtifact>,
}

impl ArtifactGuard {
    pub fn artifacts(&self) -> &[TransientArtifact] { &self.artifacts }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        for artifact in self.artifacts.drain(..) {
            self.manager.schedule_cleanup(artifact.path);
        }
    }
}
