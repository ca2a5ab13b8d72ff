use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

/// Errors that cross the HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    #[error("The upload exceeds the size limit")]
    UploadTooLarge,

    #[error("A job is already running")]
    JobInProgress,

    #[error("Failed to store upload: {0:#}")]
    StorageWrite(anyhow::Error),

    #[error("Status store failure: {0:#}")]
    StatusStore(anyhow::Error),

    #[error("No processed result is available")]
    NoResultAvailable,

    #[error("Result file {0} is missing from storage")]
    ResultMissing(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidUpload(_) => StatusCode::BAD_REQUEST,
            Self::UploadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::JobInProgress => StatusCode::CONFLICT,
            Self::NoResultAvailable | Self::ResultMissing(_) => StatusCode::NOT_FOUND,
            Self::StorageWrite(_) | Self::StatusStore(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidUpload(_) => "INVALID_UPLOAD",
            Self::UploadTooLarge => "UPLOAD_TOO_LARGE",
            Self::JobInProgress => "JOB_IN_PROGRESS",
            Self::StorageWrite(_) => "STORAGE_WRITE_FAILED",
            Self::StatusStore(_) => "STATUS_STORE_FAILED",
            Self::NoResultAvailable => "NO_RESULT_AVAILABLE",
            Self::ResultMissing(_) => "RESULT_MISSING",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            Self::StorageWrite(_) => {
                error!("Upload storage failed: {self}");
                "Failed to store the uploaded file.".to_string()
            }
            Self::StatusStore(_) | Self::Internal(_) => {
                error!("{self}");
                "An internal error occurred.".to_string()
            }
            Self::ResultMissing(file) => {
                error!(output_file = %file, "Succeeded job references a missing result file");
                "The processed file is no longer available.".to_string()
            }
            other => other.to_string(),
        };

        (
            status,
            Json(json!({
                "error": {
                    "code": self.code(),
                    "message": message
                }
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_path_errors_map_to_not_found() {
        assert_eq!(
            AppError::NoResultAvailable.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::ResultMissing("x.xlsx".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(AppError::ResultMissing("x.xlsx".into()).code(), "RESULT_MISSING");
    }

    #[test]
    fn storage_failures_hide_details_from_client() {
        let response =
            AppError::StorageWrite(anyhow::anyhow!("disk full at /secret/path")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn invalid_upload_is_a_client_error() {
        let err = AppError::InvalidUpload("missing file field".into());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "INVALID_UPLOAD");
        assert_eq!(err.to_string(), "Invalid upload: missing file field");
    }

    #[test]
    fn oversized_upload_is_payload_too_large() {
        let err = AppError::UploadTooLarge;
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(err.code(), "UPLOAD_TOO_LARGE");
    }
}
