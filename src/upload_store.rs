use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{multipart::MultipartError, Multipart},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use tokio::{fs, io::AsyncWriteExt};

use crate::error::AppError;

const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Longest client-derived part of a stored name, in bytes. Together with the
/// category, stamp and the `.log` capture suffix this stays well under the
/// usual 255-byte file name limit.
pub const MAX_FILE_NAME_BYTES: usize = 120;

/// Extensions longer than this are treated as part of the stem when cutting.
const MAX_EXTENSION_BYTES: usize = 16;

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub original_name: String,
    pub bytes: Bytes,
}

#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub name: String,
    pub path: PathBuf,
}

pub async fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create directory {}", path.display()))
}

/// Pulls the `file` field out of a multipart body. Other fields are ignored.
pub async fn parse_upload(mut multipart: Multipart) -> Result<UploadedFile, AppError> {
    let mut upload = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error("malformed multipart body", e))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let original_name = field.file_name().unwrap_or("").trim().to_string();
        if original_name.is_empty() {
            return Err(AppError::InvalidUpload(
                "the file field has no file name".into(),
            ));
        }

        let bytes = field
            .bytes()
            .await
            .map_err(|e| multipart_error("failed to read file field", e))?;
        upload = Some(UploadedFile {
            original_name,
            bytes,
        });
    }

    upload.ok_or_else(|| AppError::InvalidUpload("missing required 'file' field".into()))
}

fn multipart_error(context: &str, err: MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::UploadTooLarge
    } else {
        AppError::InvalidUpload(format!("{context}: {err}"))
    }
}

/// Keeps the last path component and replaces anything outside
/// `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_file_name(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or("");
    let mut out = String::with_capacity(base.len());
    for ch in base.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    let trimmed = out.trim_start_matches('.');
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        truncate_file_name(trimmed, MAX_FILE_NAME_BYTES)
    }
}

/// Cuts an ASCII name down to `max` bytes, keeping a short extension.
fn truncate_file_name(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }
    let ext = match name.rfind('.') {
        Some(dot) if dot > 0 && name.len() - dot <= MAX_EXTENSION_BYTES => &name[dot..],
        _ => "",
    };
    let stem = &name[..name.len() - ext.len()];
    format!("{}{ext}", &stem[..max - ext.len()])
}

pub fn build_stored_name(
    category: &str,
    at: DateTime<Utc>,
    original_name: &str,
    attempt: u32,
) -> String {
    let stamp = at.format("%Y%m%d-%H%M%S");
    let file_name = sanitize_file_name(original_name);
    if attempt == 0 {
        format!("{category}_{stamp}_{file_name}")
    } else {
        format!("{category}_{stamp}-{attempt}_{file_name}")
    }
}

/// Writes the upload under a name nobody else holds. Existing files are
/// never opened for writing; a partial file is removed on failure.
pub async fn persist_upload(
    dir: &Path,
    category: &str,
    at: DateTime<Utc>,
    upload: &UploadedFile,
) -> Result<StoredUpload> {
    ensure_dir(dir).await?;

    for attempt in 0..MAX_NAME_ATTEMPTS {
        let name = build_stored_name(category, at, &upload.original_name, attempt);
        let path = dir.join(&name);

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to create {}", path.display()))
            }
        };

        let written = async {
            file.write_all(&upload.bytes).await?;
            file.sync_all().await
        }
        .await;

        if let Err(err) = written {
            drop(file);
            let _ = fs::remove_file(&path).await;
            return Err(err).with_context(|| format!("Failed to write {}", path.display()));
        }

        return Ok(StoredUpload { name, path });
    }

    anyhow::bail!(
        "No free file name for {} after {MAX_NAME_ATTEMPTS} attempts",
        upload.original_name
    )
}
