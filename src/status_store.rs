//! File-backed single-slot store for the current job's status record.
//!
//! Writes go to a temporary file in the same directory and are renamed over
//! the status document, so readers only ever see a complete record.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::{fs, io::AsyncWriteExt};
use tracing::warn;
use uuid::Uuid;

use crate::models::{FailureKind, JobFailure, JobStatusRecord};

#[derive(Debug, Clone)]
pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns `None` when no job has ever been recorded.
    pub async fn read(&self) -> Result<Option<JobStatusRecord>> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };

        let record = serde_json::from_slice(&raw)
            .with_context(|| format!("Corrupt status document at {}", self.path.display()))?;
        Ok(Some(record))
    }

    /// Replaces the stored record in full.
    pub async fn write(&self, record: &JobStatusRecord) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create status directory {}", dir.display()))?;

        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("job_status.json");
        let tmp = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));
        let body = serde_json::to_vec_pretty(record).context("Failed to encode status record")?;

        let written = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&body).await?;
            file.sync_all().await?;
            fs::rename(&tmp, &self.path).await
        }
        .await;

        if let Err(err) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(err)
                .with_context(|| format!("Failed to write status to {}", self.path.display()));
        }
        sync_dir(dir)
            .await
            .with_context(|| format!("Failed to sync status directory {}", dir.display()))
    }

    /// Marks a record left in a non-terminal state by a previous process as
    /// failed. Returns the rewritten record, if any.
    pub async fn recover_interrupted(&self) -> Result<Option<JobStatusRecord>> {
        let Some(record) = self.read().await? else {
            return Ok(None);
        };
        if record.status.is_terminal() {
            return Ok(None);
        }

        warn!(
            input_file = %record.input_file,
            started_at = %record.started_at,
            "Found unfinished job from a previous run; marking it failed"
        );
        let failed = record.failed(
            JobFailure {
                kind: FailureKind::Interrupted,
                message: "The service stopped before the job finished".to_string(),
                exit_code: None,
            },
            Utc::now(),
        );
        self.write(&failed).await?;
        Ok(Some(failed))
    }
}

/// Flushes directory entries so a completed rename survives a crash.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobState;

    fn running(name: &str) -> JobStatusRecord {
        JobStatusRecord::running(name.to_string(), format!("{name}.log"), Utc::now())
    }

    #[tokio::test]
    async fn read_before_any_write_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path().join("job_status.json"));
        assert!(store.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_replaces_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path().join("state").join("job_status.json"));

        let first = running("a.xlsx");
        store.write(&first).await.unwrap();
        let done = first.succeeded("a.xlsx".into(), Utc::now());
        store.write(&done).await.unwrap();
        store.write(&running("b.xlsx")).await.unwrap();

        let current = store.read().await.unwrap().unwrap();
        assert_eq!(current.input_file, "b.xlsx");
        assert_eq!(current.status, JobState::Running);
        assert!(current.output_file.is_none());
    }

    #[tokio::test]
    async fn record_survives_a_new_store_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job_status.json");
        let record = running("a.xlsx").succeeded("a.xlsx".into(), Utc::now());
        StatusStore::new(&path).write(&record).await.unwrap();

        let reopened = StatusStore::new(&path);
        assert_eq!(reopened.read().await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn write_leaves_no_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path().join("job_status.json"));
        store.write(&running("a.xlsx")).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["job_status.json".to_string()]);
    }

    #[tokio::test]
    async fn directory_sync_succeeds_for_status_directory() {
        let dir = tempfile::tempdir().unwrap();
        sync_dir(dir.path()).await.unwrap();

        // relative status paths sync the working directory
        let store = StatusStore::new("job_status.json");
        let parent = store.path.parent().unwrap();
        assert!(parent.as_os_str().is_empty());
        sync_dir(Path::new(".")).await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job_status.json");
        std::fs::write(&path, b"{\"status\": \"RUNN").unwrap();

        assert!(StatusStore::new(&path).read().await.is_err());
    }

    #[tokio::test]
    async fn recover_marks_running_job_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path().join("job_status.json"));
        store.write(&running("a.xlsx")).await.unwrap();

        let recovered = store.recover_interrupted().await.unwrap().unwrap();
        assert_eq!(recovered.status, JobState::Failed);
        assert!(recovered.finished_at.is_some());
        assert_eq!(
            recovered.failure.map(|f| f.kind),
            Some(FailureKind::Interrupted)
        );

        // terminal records are left alone
        assert!(store.recover_interrupted().await.unwrap().is_none());
    }
}
