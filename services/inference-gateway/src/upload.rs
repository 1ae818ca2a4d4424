//! Multipart ingestion for the image routes. Files stay in memory here; the
//! artifact manager decides when they touch the disk.

use axum::body::Bytes;
use axum::extract::multipart::{Multipart, MultipartError};
use tracing::debug;

use crate::artifacts::UploadedFile;
use crate::error::GatewayError;

pub const IMAGE_FIELD: &str = "image";
pub const IMAGES_FIELD: &str = "images";

/// Reads every file part of `multipart`. Only `accepted_field` may carry
/// files, at most `max_files` of them, each `image/*` and no larger than
/// `max_file_bytes`. Plain (non-file) parts are skipped. Parsing stops at the
/// first file over the count, before its body is read.
pub async fn collect_images(
    mut multipart: Multipart,
    accepted_field: &str,
    max_files: usize,
    max_file_bytes: usize,
) -> Result<Vec<UploadedFile>, GatewayError> {
    let mut files = Vec::new();
    while let Some(mut field) = multipart.next_field().await.map_err(malformed)? {
        let field_name = field.name().unwrap_or_default().to_string();
        let Some(original_name) = field.file_name().map(str::to_owned) else {
            debug!(field = %field_name, "skipping non-file part");
            continue;
        };
        if field_name != accepted_field {
            return Err(GatewayError::invalid_with_note(
                format!("Unexpected field \"{field_name}\""),
                format!("Send images as multipart/form-data with field name \"{accepted_field}\""),
            ));
        }
        if files.len() >= max_files {
            return Err(GatewayError::invalid(too_many(max_files)));
        }
        let mime_type = field.content_type().unwrap_or_default().to_string();
        if !mime_type.starts_with("image/") {
            return Err(GatewayError::invalid("Only image files are allowed!"));
        }
        let mut buf = Vec::new();
        while let Some(chunk) = field.chunk().await.map_err(malformed)? {
            if buf.len() + chunk.len() > max_file_bytes {
                return Err(GatewayError::invalid(too_large(max_file_bytes)));
            }
            buf.extend_from_slice(&chunk);
        }
        files.push(UploadedFile { field_name, original_name, mime_type, bytes: Bytes::from(buf) });
    }
    Ok(files)
}

fn malformed(e: MultipartError) -> GatewayError {
    GatewayError::invalid(format!("Malformed multipart body: {}", e.body_text()))
}

fn too_many(max_files: usize) -> String {
    if max_files == 1 {
        "Exactly one image file is allowed; use the batch endpoint for more".to_string()
    } else {
        format!("Too many files. Maximum {max_files} files per batch.")
    }
}

fn too_large(max_file_bytes: usize) -> String {
    const MB: usize = 1024 * 1024;
    if max_file_bytes % MB == 0 {
        format!("File too large. Maximum size is {}MB.", max_file_bytes / MB)
    } else {
        format!("File too large. Maximum size is {max_file_bytes} bytes.")
    }
}
