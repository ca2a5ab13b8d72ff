use axum::{
    body::{Body, Bytes},
    extract::{Multipart, State},
    http::{header, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;
use tokio::fs;
use tokio_util::io::ReaderStream;

use crate::{
    auth::{load_users, verify_login},
    error::{AppError, AppResult},
    jobs::start_upload_job,
    models::{JobState, LoginRequest, StatusResponse, UploadResponse},
    upload_store::parse_upload,
    AppState,
};

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "timestamp": Utc::now() }))
}

pub async fn login(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let request: LoginRequest = serde_json::from_slice(&body).unwrap_or_default();
    let users = load_users(&state.config.users_file).await;
    verify_login(&users, &request)
}

/// POST /api/upload
///
/// Stores the multipart `file` field and runs the processing job before
/// answering, so the response always carries a terminal status.
pub async fn upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> AppResult<Response<Body>> {
    let upload = parse_upload(multipart).await?;
    let run = start_upload_job(state, upload).await?;

    let Some(err) = run.error else {
        let response = UploadResponse {
            status: run.record.status,
            saved_as: run.record.input_file,
        };
        return Ok((StatusCode::OK, Json(response)).into_response());
    };

    Ok((
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "status": run.record.status,
            "saved_as": run.record.input_file,
            "error": {
                "code": err.response_code(),
                "message": "The processing job failed. Check the job log for details."
            }
        })),
    )
        .into_response())
}

pub async fn get_status(State(state): State<AppState>) -> AppResult<Json<StatusResponse>> {
    let job = state.store.read().await.map_err(AppError::StatusStore)?;
    Ok(Json(StatusResponse {
        has_job: job.is_some(),
        job,
    }))
}

pub async fn get_result(State(state): State<AppState>) -> AppResult<Response<Body>> {
    let record = state
        .store
        .read()
        .await
        .map_err(AppError::StatusStore)?
        .ok_or(AppError::NoResultAvailable)?;

    if record.status != JobState::Succeeded {
        return Err(AppError::NoResultAvailable);
    }
    let output_file = record.output_file.ok_or(AppError::NoResultAvailable)?;

    let path = state.config.upload_dir.join(&output_file);
    let file = match fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::ResultMissing(output_file));
        }
        Err(err) => {
            return Err(AppError::Internal(format!(
                "Failed to open result {}: {err}",
                path.display()
            )));
        }
    };
    let size = file
        .metadata()
        .await
        .map_err(|err| AppError::Internal(format!("Failed to stat result: {err}")))?
        .len();

    let content_disposition = format!("attachment; filename=\"{output_file}\"");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, size)
        .header(header::CONTENT_DISPOSITION, content_disposition)
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|err| AppError::Internal(format!("Failed to build download response: {err}")))
}
