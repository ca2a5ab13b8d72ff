use std::path::Path;

use axum::{http::StatusCode, Json};
use serde_json::{json, Value};
use tokio::fs;
use tracing::warn;

use crate::models::{LoginRequest, UserEntry};

/// Loads the credential list. A missing or unreadable file yields an empty
/// list so every login is rejected.
pub async fn load_users(path: &Path) -> Vec<UserEntry> {
    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!("Users file not found at {}", path.display());
            return Vec::new();
        }
        Err(err) => {
            warn!("Failed reading users file {}: {err}", path.display());
            return Vec::new();
        }
    };

    match serde_json::from_slice(&raw) {
        Ok(users) => users,
        Err(err) => {
            warn!("Failed parsing users file {}: {err}", path.display());
            Vec::new()
        }
    }
}

pub fn verify_login(users: &[UserEntry], request: &LoginRequest) -> (StatusCode, Json<Value>) {
    let username = request.username.as_deref().unwrap_or("").trim();
    let password = request.password.as_deref().unwrap_or("").trim();

    if username.is_empty() || password.is_empty() {
        return rejected(StatusCode::BAD_REQUEST, "missing_fields");
    }

    let matched = users.iter().find(|user| {
        user.username == username && user.password == password && user.active.unwrap_or(true)
    });

    let Some(user) = matched else {
        return rejected(StatusCode::UNAUTHORIZED, "invalid_credentials");
    };

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "username": user.username,
            "role": user.role.as_deref().unwrap_or("user")
        })),
    )
}

fn rejected(status: StatusCode, code: &str) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({
            "success": false,
            "error": code
        })),
    )
}
