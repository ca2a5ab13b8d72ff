use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Result;

use crate::upload_store::sanitize_file_name;

const MAX_CATEGORY_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub job_category: String,
    pub upload_dir: PathBuf,
    pub log_dir: PathBuf,
    pub status_file: PathBuf,
    pub job_program: String,
    pub job_args: Vec<String>,
    pub job_timeout: Duration,
    pub max_upload_bytes: usize,
    pub users_file: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_raw =
            env::var("FACTA_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:5050".to_string());
        let bind_normalized = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        let bind_addr = bind_normalized
            .parse::<SocketAddr>()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 5050)));

        let data_root =
            PathBuf::from(env::var("FACTA_DATA_ROOT").unwrap_or_else(|_| "data".to_string()));

        let mut job_category = sanitize_file_name(
            &env::var("FACTA_JOB_CATEGORY").unwrap_or_else(|_| "facta".to_string()),
        );
        // sanitized names are ASCII
        job_category.truncate(MAX_CATEGORY_BYTES);

        let upload_dir = env_path("FACTA_UPLOAD_DIR")
            .unwrap_or_else(|| data_root.join("uploads").join(&job_category));
        let log_dir = env_path("FACTA_LOG_DIR").unwrap_or_else(|| data_root.join("logs"));
        let status_file =
            env_path("FACTA_STATUS_FILE").unwrap_or_else(|| data_root.join("job_status.json"));

        let job_program = env::var("FACTA_JOB_PROGRAM")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "python3".to_string());

        let job_args = env::var("FACTA_JOB_ARGS")
            .unwrap_or_else(|_| "automation/facta_clt_off.py".to_string())
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let job_timeout_seconds = env::var("FACTA_JOB_TIMEOUT_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30 * 60)
            .max(1);

        let max_upload_bytes = env::var("FACTA_MAX_UPLOAD_BYTES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(50 * 1024 * 1024);

        let users_file = env_path("FACTA_USERS_FILE")
            .unwrap_or_else(|| PathBuf::from("config").join("users.json"));

        Ok(Self {
            bind_addr,
            job_category,
            upload_dir,
            log_dir,
            status_file,
            job_program,
            job_args,
            job_timeout: Duration::from_secs(job_timeout_seconds),
            max_upload_bytes,
            users_file,
        })
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
