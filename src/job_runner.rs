//! Runs the external processing executable against one stored upload.
//!
//! The job is invoked as `<program> <args..> --input <file> --log_dir <dir>`
//! with stdin closed, in its own process group. Both output streams are
//! captured and the run, including draining its output, is bounded by a
//! deadline; when the deadline passes the whole group is killed.

use std::{
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    task::JoinHandle,
};

use crate::{
    config::Config,
    models::{FailureKind, JobFailure},
};

/// Per-stream capture cap (10 MiB). Output past the cap is read and dropped.
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// How long readers may keep flushing after the job has been killed.
const KILL_SETTLE: Duration = Duration::from_millis(250);

type Capture = Arc<Mutex<Vec<u8>>>;

#[derive(Debug, Clone)]
pub struct JobOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("failed to start {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("job exited with {}", describe_exit(.exit_code))]
    Exited {
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// The deadline passed before the job exited and closed its output.
    #[error("job did not finish within {timeout_ms}ms and was killed")]
    TimedOut {
        timeout_ms: u64,
        stdout: String,
        stderr: String,
    },

    #[error("failed waiting for job: {0}")]
    Wait(#[source] std::io::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

impl JobError {
    pub fn to_failure(&self) -> JobFailure {
        let (kind, exit_code) = match self {
            Self::Launch { .. } => (FailureKind::LaunchFailed, None),
            Self::Exited { exit_code, .. } => (FailureKind::ExitedNonzero, *exit_code),
            Self::TimedOut { .. } => (FailureKind::TimedOut, None),
            Self::Wait(_) => (FailureKind::WaitFailed, None),
        };
        JobFailure {
            kind,
            message: self.to_string(),
            exit_code,
        }
    }

    pub fn response_code(&self) -> &'static str {
        match self {
            Self::Launch { .. } => "JOB_LAUNCH_FAILED",
            Self::Exited { .. } | Self::Wait(_) => "JOB_EXECUTION_FAILED",
            Self::TimedOut { .. } => "JOB_TIMED_OUT",
        }
    }

    pub fn captured_streams(&self) -> Option<(&str, &str)> {
        match self {
            Self::Exited { stdout, stderr, .. } | Self::TimedOut { stdout, stderr, .. } => {
                Some((stdout, stderr))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobRunner {
    program: String,
    args: Vec<String>,
    log_dir: PathBuf,
    timeout: Duration,
}

impl JobRunner {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        log_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            log_dir: log_dir.into(),
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.job_program.clone(),
            config.job_args.clone(),
            config.log_dir.clone(),
            config.job_timeout,
        )
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Human-readable command line, for logs.
    pub fn describe(&self, input: &Path) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.push("--input".to_string());
        parts.push(input.display().to_string());
        parts.push("--log_dir".to_string());
        parts.push(self.log_dir.display().to_string());
        parts.join(" ")
    }

    fn command(&self, input: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--input")
            .arg(input)
            .arg("--log_dir")
            .arg(&self.log_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// Runs the job until it exits and closes its output, or until the
    /// deadline.
    pub async fn run(&self, input: &Path) -> Result<JobOutput, JobError> {
        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut child = self.command(input).spawn().map_err(|source| JobError::Launch {
            program: self.program.clone(),
            source,
        })?;
        let pid = child.id();

        let stdout = Capture::default();
        let stderr = Capture::default();
        let mut readers = vec![
            tokio::spawn(read_stream(child.stdout.take(), stdout.clone())),
            tokio::spawn(read_stream(child.stderr.take(), stderr.clone())),
        ];

        let waited = tokio::time::timeout_at(deadline, child.wait()).await;
        let status: ExitStatus = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                kill_job(pid, &mut child).await;
                settle_readers(&mut readers).await;
                return Err(JobError::Wait(err));
            }
            Err(_elapsed) => {
                kill_job(pid, &mut child).await;
                settle_readers(&mut readers).await;
                return Err(self.timed_out(&stdout, &stderr));
            }
        };

        let drained = tokio::time::timeout_at(deadline, async {
            for reader in readers.iter_mut() {
                let _ = reader.await;
            }
        })
        .await;
        if drained.is_err() {
            // the job exited but something it started still holds the pipes
            kill_group(pid);
            settle_readers(&mut readers).await;
            return Err(self.timed_out(&stdout, &stderr));
        }

        let stdout = take_capture(&stdout);
        let stderr = take_capture(&stderr);

        if !status.success() {
            return Err(JobError::Exited {
                exit_code: status.code(),
                stdout,
                stderr,
            });
        }

        Ok(JobOutput {
            exit_code: status.code().unwrap_or(0),
            stdout,
            stderr,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    fn timed_out(&self, stdout: &Capture, stderr: &Capture) -> JobError {
        JobError::TimedOut {
            timeout_ms: self.timeout.as_millis() as u64,
            stdout: take_capture(stdout),
            stderr: take_capture(stderr),
        }
    }
}

async fn kill_job(pid: Option<u32>, child: &mut Child) {
    kill_group(pid);
    let _ = child.kill().await;
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::{
        sys::signal::{killpg, Signal},
        unistd::Pid,
    };

    if let Some(pid) = pid {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

/// Gives readers a moment to collect what the killed job left in the pipes,
/// then stops them.
async fn settle_readers(readers: &mut [JoinHandle<()>]) {
    let _ = tokio::time::timeout(KILL_SETTLE, async {
        for reader in readers.iter_mut() {
            let _ = reader.await;
        }
    })
    .await;
    for reader in readers.iter() {
        reader.abort();
    }
}

async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>, sink: Capture) {
    let Some(mut handle) = handle else {
        return;
    };
    let mut chunk = [0u8; 8192];
    loop {
        let n = match handle.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let mut buf = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let room = MAX_OUTPUT_BYTES.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..n.min(room)]);
    }
}

fn take_capture(capture: &Capture) -> String {
    let buf = capture.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("job.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        path
    }

    fn runner(dir: &Path, script: &Path, timeout: Duration) -> JobRunner {
        JobRunner::new(
            "sh",
            vec![script.display().to_string()],
            dir.join("logs"),
            timeout,
        )
    }

    #[tokio::test]
    async fn passes_input_and_log_dir_flags() {
        let dir = tempfile::tempdir().unwrap();
        let job = script(dir.path(), "echo \"$1 $2 $3 $4\"\n");
        let input = dir.path().join("in.xlsx");

        let output = runner(dir.path(), &job, Duration::from_secs(5))
            .run(&input)
            .await
            .unwrap();

        assert_eq!(output.exit_code, 0);
        assert_eq!(
            output.stdout.trim(),
            format!(
                "--input {} --log_dir {}",
                input.display(),
                dir.path().join("logs").display()
            )
        );
    }

    #[tokio::test]
    async fn nonzero_exit_keeps_code_and_streams() {
        let dir = tempfile::tempdir().unwrap();
        let job = script(dir.path(), "echo working\necho broken >&2\nexit 3\n");

        let err = runner(dir.path(), &job, Duration::from_secs(5))
            .run(&dir.path().join("in.xlsx"))
            .await
            .unwrap_err();

        match &err {
            JobError::Exited {
                exit_code,
                stdout,
                stderr,
            } => {
                assert_eq!(*exit_code, Some(3));
                assert_eq!(stdout.trim(), "working");
                assert_eq!(stderr.trim(), "broken");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let failure = err.to_failure();
        assert_eq!(failure.kind, FailureKind::ExitedNonzero);
        assert_eq!(failure.exit_code, Some(3));
        assert_eq!(err.response_code(), "JOB_EXECUTION_FAILED");
    }

    #[tokio::test]
    async fn missing_executable_is_a_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = JobRunner::new(
            dir.path().join("no-such-job").display().to_string(),
            Vec::new(),
            dir.path().join("logs"),
            Duration::from_secs(5),
        );

        let err = runner.run(&dir.path().join("in.xlsx")).await.unwrap_err();
        assert!(matches!(err, JobError::Launch { .. }));
        assert_eq!(err.to_failure().kind, FailureKind::LaunchFailed);
        assert_eq!(err.response_code(), "JOB_LAUNCH_FAILED");
    }

    #[tokio::test]
    async fn slow_job_is_killed_at_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let job = script(dir.path(), "echo begin\nsleep 10\n");

        let started = Instant::now();
        let err = runner(dir.path(), &job, Duration::from_millis(300))
            .run(&dir.path().join("in.xlsx"))
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(err.to_failure().kind, FailureKind::TimedOut);
        assert_eq!(err.response_code(), "JOB_TIMED_OUT");
        let (stdout, _) = err.captured_streams().unwrap();
        assert_eq!(stdout.trim(), "begin");
    }

    #[tokio::test]
    async fn background_child_holding_output_counts_against_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let job = script(dir.path(), "echo started\nsleep 6 &\nexit 0\n");

        let started = Instant::now();
        let err = runner(dir.path(), &job, Duration::from_millis(500))
            .run(&dir.path().join("in.xlsx"))
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(matches!(err, JobError::TimedOut { .. }));
        let (stdout, _) = err.captured_streams().unwrap();
        assert_eq!(stdout.trim(), "started");
    }

    #[tokio::test]
    async fn background_child_with_closed_output_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let job = script(dir.path(), "sleep 6 >/dev/null 2>&1 &\necho done\nexit 0\n");

        let output = runner(dir.path(), &job, Duration::from_secs(3))
            .run(&dir.path().join("in.xlsx"))
            .await
            .unwrap();

        assert_eq!(output.stdout.trim(), "done");
    }

    #[test]
    fn describe_lists_full_command_line() {
        let runner = JobRunner::new(
            "python3",
            vec!["automation/facta_clt_off.py".to_string()],
            "data/logs",
            Duration::from_secs(1),
        );
        assert_eq!(
            runner.describe(Path::new("data/uploads/facta/a.xlsx")),
            "python3 automation/facta_clt_off.py --input data/uploads/facta/a.xlsx --log_dir data/logs"
        );
    }
}
