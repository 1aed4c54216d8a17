// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Client Contributors

// VPN Client - Authentication Module
// Shared-secret check on every request via the Auth-Key header

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::permissions::{self, MODE_PRIVATE_FILE};

/// HTTP header carrying the daemon's shared secret
pub const AUTH_KEY_HEADER: &str = "Auth-Key";

/// Mask all but the last 4 characters of a key for logging
pub fn obfuscate_key(key: &str) -> String {
    let visible = 4;
    match key.len().checked_sub(visible) {
        Some(hidden) if key.is_char_boundary(hidden) => {
            format!("{}{}", "*".repeat(hidden), &key[hidden..])
        }
        _ => "*".repeat(key.len()),
    }
}

/// Read the key from `path`, or generate and store a new one.
///
/// Returns the key and whether it was freshly generated.
pub fn load_or_generate_key(path: &Path) -> Result<(Zeroizing<String>, bool)> {
    if path.exists() {
        let contents = Zeroizing::new(
            fs::read_to_string(path).context("Failed to read auth key file")?,
        );
        let key = contents.trim();
        if !key.is_empty() {
            info!("Loaded auth key from: {}", path.display());
            return Ok((Zeroizing::new(key.to_string()), false));
        }
        warn!("Auth key file {} is empty, generating a new key", path.display());
    }

    let key = Zeroizing::new(Uuid::new_v4().to_string());
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create auth key directory")?;
    }
    permissions::write_with_mode(path, key.as_bytes(), MODE_PRIVATE_FILE)
        .context("Failed to write auth key file")?;

    info!(
        "Generated auth key {} (stored in {})",
        obfuscate_key(&key),
        path.display()
    );
    Ok((key, true))
}

/// Authentication middleware state
#[derive(Clone)]
pub struct AuthState {
    key: Zeroizing<String>,
}

impl AuthState {
    pub fn new(key: Zeroizing<String>) -> Self {
        Self { key }
    }

    fn accepts(&self, provided: &str) -> bool {
        let expected = self.key.as_bytes();
        let provided = provided.as_bytes();
        // Length leaks, content does not
        expected.len() == provided.len()
            && expected
                .iter()
                .zip(provided)
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

/// Rejects requests without a matching `Auth-Key` header with 401
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let provided = request
        .headers()
        .get(AUTH_KEY_HEADER)
        .and_then(|h| h.to_str().ok());

    match provided {
        Some(key) if auth.accepts(key) => Ok(next.run(request).await),
        Some(_) => {
            warn!("Rejected {} {}: invalid auth key", request.method(), request.uri().path());
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Rejected {} {}: missing auth key", request.method(), request.uri().path());
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, middleware, routing::get, Router};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(key: &str) -> Router {
        let auth = AuthState::new(Zeroizing::new(key.to_string()));
        Router::new()
            .route("/ping", get(|| async { "OK" }))
            .layer(middleware::from_fn_with_state(auth, auth_middleware))
    }

    async fn status_with(key: Option<&str>) -> StatusCode {
        let mut request = axum::http::Request::builder().uri("/ping");
        if let Some(key) = key {
            request = request.header(AUTH_KEY_HEADER, key);
        }
        app("correct-key")
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[test]
    fn test_obfuscate_key() {
        let key = "abc123de-f456-7890-1234-567890abcdef";
        let masked = obfuscate_key(key);
        assert_eq!(masked.len(), key.len());
        assert!(masked.ends_with("cdef"));
        assert!(masked.starts_with("****"));

        assert_eq!(obfuscate_key("1234"), "1234");
        assert_eq!(obfuscate_key("abc"), "***");
    }

    #[test]
    fn test_generate_then_reload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("keys").join("daemon.token");

        let (key, generated) = load_or_generate_key(&path).unwrap();
        assert!(generated);
        assert!(Uuid::parse_str(&key).is_ok());

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        let (reloaded, generated) = load_or_generate_key(&path).unwrap();
        assert!(!generated);
        assert_eq!(*reloaded, *key);
    }

    #[test]
    fn test_empty_key_file_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("daemon.token");
        fs::write(&path, "  \n").unwrap();

        let (key, generated) = load_or_generate_key(&path).unwrap();
        assert!(generated);
        assert_eq!(fs::read_to_string(&path).unwrap(), *key);
    }

    #[tokio::test]
    async fn test_middleware_checks_header() {
        assert_eq!(status_with(Some("correct-key")).await, StatusCode::OK);
        assert_eq!(status_with(Some("wrong-key!!")).await, StatusCode::UNAUTHORIZED);
        assert_eq!(status_with(Some("short")).await, StatusCode::UNAUTHORIZED);
        assert_eq!(status_with(None).await, StatusCode::UNAUTHORIZED);
    }
}
