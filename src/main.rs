mod api;
mod auth;
mod config;
mod error;
mod job_runner;
mod jobs;
mod models;
mod status_store;
mod upload_store;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use config::Config;
use job_runner::JobRunner;
use status_store::StatusStore;
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: StatusStore,
    pub runner: JobRunner,
    /// Held for the whole lifetime of a job; at most one runs at a time.
    pub job_gate: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            store: StatusStore::new(config.status_file.clone()),
            runner: JobRunner::from_config(&config),
            job_gate: Arc::new(Mutex::new(())),
            config,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let max_upload_bytes = state.config.max_upload_bytes;

    let routes = Router::new()
        .route("/health", get(api::health))
        .route("/login", post(api::login))
        .route("/upload", post(api::upload))
        .route("/status", get(api::get_status))
        .route("/result", get(api::get_result))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    Router::new()
        .nest("/api", routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "facta_job_api=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    upload_store::ensure_dir(&config.upload_dir).await?;
    upload_store::ensure_dir(&config.log_dir).await?;

    let state = AppState::new(config.clone());
    if let Some(record) = state.store.recover_interrupted().await? {
        info!(input_file = %record.input_file, "Interrupted job marked as failed");
    }

    info!(
        program = %config.job_program,
        upload_dir = %config.upload_dir.display(),
        status_file = %config.status_file.display(),
        timeout_secs = config.job_timeout.as_secs(),
        "Job runner configured"
    );

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("facta-job-api listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
