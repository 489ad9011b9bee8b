//! API key authentication middleware.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use std::io::Read;

use super::state::ApiState;

/// Header name for API key.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Reject requests whose `X-API-Key` does not hash to the configured value.
///
/// Without a configured hash every request is let through.
pub async fn require_api_key(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(ref expected_hash) = state.api_key_hash else {
        return next.run(request).await;
    };

    let api_key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    match api_key {
        Some(key) if hash_api_key(key).eq_ignore_ascii_case(expected_hash) => {
            next.run(request).await
        }
        Some(_) => (StatusCode::UNAUTHORIZED, "Invalid API key").into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            format!("Missing {} header", API_KEY_HEADER),
        )
            .into_response(),
    }
}

/// Hash an API key using SHA-256.
pub fn hash_api_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Generate a random 128-bit API key, hex encoded.
pub fn generate_api_key() -> String {
    let mut seed = [0u8; 32];
    let from_os = std::fs::File::open("/dev/urandom")
        .and_then(|mut f| f.read_exact(&mut seed))
        .is_ok();

    let mut hasher = Sha256::new();
    hasher.update(seed);
    if !from_os {
        // No OS randomness: fall back to time and pid
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        hasher.update(nanos.to_le_bytes());
        hasher.update(std::process::id().to_le_bytes());
    }
    hex::encode(&hasher.finalize()[..16])
}
