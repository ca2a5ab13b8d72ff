use std::{net::SocketAddr, path::Path, time::Duration};

use crate::{config::Config, job_runner::JobRunner, AppState};

pub fn test_config(root: &Path, job_program: &str, job_args: Vec<String>) -> Config {
    Config {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        job_category: "facta".to_string(),
        upload_dir: root.join("uploads").join("facta"),
        log_dir: root.join("logs"),
        status_file: root.join("job_status.json"),
        job_program: job_program.to_string(),
        job_args,
        job_timeout: Duration::from_secs(10),
        max_upload_bytes: 1024 * 1024,
        users_file: root.join("users.json"),
    }
}

/// State whose job is a `sh` script with the given body.
pub fn scripted_state(root: &Path, body: &str) -> AppState {
    let script = root.join("job.sh");
    std::fs::write(&script, format!("#!/bin/sh\n{body}")).expect("write job script");
    AppState::new(test_config(
        root,
        "sh",
        vec![script.display().to_string()],
    ))
}

/// State whose job executable does not exist.
pub fn missing_job_state(root: &Path) -> AppState {
    let program = root.join("bin").join("facta_clt_off");
    AppState::new(test_config(root, &program.display().to_string(), Vec::new()))
}

/// Replaces the job deadline of an existing state.
pub fn with_job_timeout(mut state: AppState, timeout: Duration) -> AppState {
    state.config.job_timeout = timeout;
    state.runner = JobRunner::from_config(&state.config);
    state
}
