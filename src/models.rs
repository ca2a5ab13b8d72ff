use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The executable could not be started; no process ran.
    LaunchFailed,
    ExitedNonzero,
    TimedOut,
    WaitFailed,
    /// Found unfinished at startup.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// The single persisted job slot.
///
/// `finished_at` is set iff `status` is terminal, `output_file` only when
/// the job succeeded and `failure` only when it failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusRecord {
    pub status: JobState,
    pub input_file: String,
    #[serde(default)]
    pub output_file: Option<String>,
    pub log_reference: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
}

impl JobStatusRecord {
    pub fn running(input_file: String, log_reference: String, started_at: DateTime<Utc>) -> Self {
        Self {
            status: JobState::Running,
            input_file,
            output_file: None,
            log_reference,
            started_at,
            finished_at: None,
            failure: None,
        }
    }

    pub fn succeeded(&self, output_file: String, finished_at: DateTime<Utc>) -> Self {
        Self {
            status: JobState::Succeeded,
            input_file: self.input_file.clone(),
            output_file: Some(output_file),
            log_reference: self.log_reference.clone(),
            started_at: self.started_at,
            finished_at: Some(finished_at),
            failure: None,
        }
    }

    pub fn failed(&self, failure: JobFailure, finished_at: DateTime<Utc>) -> Self {
        Self {
            status: JobState::Failed,
            input_file: self.input_file.clone(),
            output_file: None,
            log_reference: self.log_reference.clone(),
            started_at: self.started_at,
            finished_at: Some(finished_at),
            failure: Some(failure),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub has_job: bool,
    #[serde(flatten)]
    pub job: Option<JobStatusRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResponse {
    pub status: JobState,
    pub saved_as: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
}
