use std::{future::Future, path::Path, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::fs;
use tracing::{error, info, warn};

use crate::{
    error::{AppError, AppResult},
    job_runner::{JobError, JobOutput},
    models::JobStatusRecord,
    upload_store::{ensure_dir, persist_upload, sanitize_file_name, UploadedFile},
    AppState,
};

const TERMINAL_WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Terminal outcome of one upload-triggered job.
#[derive(Debug)]
pub struct JobRun {
    pub record: JobStatusRecord,
    pub error: Option<JobError>,
}

/// Claims the single job slot and runs the upload through to a terminal
/// status. Fails with `JobInProgress` without touching storage when another
/// job holds the slot.
///
/// The sequence runs in its own task so a dropped request cannot leave the
/// store in RUNNING.
pub async fn start_upload_job(state: AppState, upload: UploadedFile) -> AppResult<JobRun> {
    let guard = state
        .job_gate
        .clone()
        .try_lock_owned()
        .map_err(|_| AppError::JobInProgress)?;

    let task = tokio::spawn(async move {
        let _guard = guard;
        run_upload_job(&state, upload).await
    });

    task.await
        .map_err(|err| AppError::Internal(format!("Upload job task failed: {err}")))?
}

async fn run_upload_job(state: &AppState, upload: UploadedFile) -> AppResult<JobRun> {
    let config = &state.config;
    let started_at = Utc::now();

    let stored = persist_upload(&config.upload_dir, &config.job_category, started_at, &upload)
        .await
        .map_err(AppError::StorageWrite)?;
    info!(
        original_name = %upload.original_name,
        stored_as = %stored.name,
        size_bytes = upload.bytes.len(),
        "Upload stored"
    );

    let initial = JobStatusRecord::running(
        stored.name.clone(),
        format!("{}.log", stored.name),
        started_at,
    );
    state.store.write(&initial).await.map_err(AppError::StatusStore)?;

    if let Err(err) = ensure_dir(state.runner.log_dir()).await {
        warn!("Log directory unavailable before job start: {err:#}");
    }

    let command = state.runner.describe(&stored.path);
    info!(input_file = %stored.name, command = %command, "Job started");
    let outcome = state.runner.run(&stored.path).await;
    let finished_at = Utc::now();

    let log_path = state.runner.log_dir().join(&initial.log_reference);
    if let Err(err) = write_capture_log(&log_path, &command, &outcome).await {
        warn!("Failed writing job capture log: {err:#}");
    }

    let (record, job_error) = match outcome {
        Ok(output) => {
            let output_file =
                resolve_output_file(&config.upload_dir, &stored.name, &output.stdout).await;
            info!(
                input_file = %stored.name,
                output_file = %output_file,
                duration_ms = output.duration_ms,
                "Job succeeded"
            );
            (initial.succeeded(output_file, finished_at), None)
        }
        Err(err) => {
            let failure = err.to_failure();
            match &err {
                JobError::Launch { program, source } => error!(
                    input_file = %stored.name,
                    program = %program,
                    "Job could not be started: {source}"
                ),
                JobError::Exited {
                    exit_code, stderr, ..
                } => error!(
                    input_file = %stored.name,
                    exit_code = ?exit_code,
                    stderr = %stderr.trim(),
                    "Job exited with failure"
                ),
                other => error!(input_file = %stored.name, "Job failed: {other}"),
            }
            (initial.failed(failure, finished_at), Some(err))
        }
    };

    with_one_retry("terminal status write", || state.store.write(&record))
        .await
        .map_err(|err| {
            error!(
                input_file = %record.input_file,
                "Could not record terminal job status: {err:#}"
            );
            AppError::StatusStore(err)
        })?;

    Ok(JobRun {
        record,
        error: job_error,
    })
}

/// Runs `op`, and once more after a short pause if it fails.
async fn with_one_retry<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(err) => {
            warn!("{what} failed, retrying once: {err:#}");
            tokio::time::sleep(TERMINAL_WRITE_RETRY_DELAY).await;
            op().await
        }
    }
}

/// The job result is the input file unless the job's last stdout line is a
/// JSON object naming another file in the upload directory.
async fn resolve_output_file(upload_dir: &Path, input_file: &str, stdout: &str) -> String {
    let Some(last_line) = stdout.lines().rev().find(|l| !l.trim().is_empty()) else {
        return input_file.to_string();
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(last_line.trim()) else {
        return input_file.to_string();
    };
    let Some(candidate) = value.get("output_file").and_then(|v| v.as_str()) else {
        return input_file.to_string();
    };

    if sanitize_file_name(candidate) != candidate {
        warn!(output_file = %candidate, "Ignoring job output name that is not a plain file name");
        return input_file.to_string();
    }

    match fs::metadata(upload_dir.join(candidate)).await {
        Ok(meta) if meta.is_file() => candidate.to_string(),
        _ => {
            warn!(output_file = %candidate, "Job reported an output file that does not exist");
            input_file.to_string()
        }
    }
}

async fn write_capture_log(
    path: &Path,
    command: &str,
    outcome: &Result<JobOutput, JobError>,
) -> Result<()> {
    let mut text = format!("command: {command}\n");
    match outcome {
        Ok(output) => {
            text.push_str(&format!(
                "outcome: succeeded\nexit_code: {}\nduration_ms: {}\n",
                output.exit_code, output.duration_ms
            ));
            push_streams(&mut text, &output.stdout, &output.stderr);
        }
        Err(err) => {
            text.push_str(&format!("outcome: failed\nerror: {err}\n"));
            if let Some((stdout, stderr)) = err.captured_streams() {
                push_streams(&mut text, stdout, stderr);
            }
        }
    }

    if let Some(parent) = path.parent() {
        ensure_dir(parent).await?;
    }
    fs::write(path, text)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

fn push_streams(text: &mut String, stdout: &str, stderr: &str) {
    text.push_str("--- stdout ---\n");
    text.push_str(stdout);
    text.push_str("\n--- stderr ---\n");
    text.push_str(stderr);
    text.push('\n');
}
