//! Shared-key authentication.

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use cloudagent_wire::API_KEY_HEADER;
use tracing::warn;

use super::error::ApiError;
use crate::state::AppState;

/// Accepts the key from `x-api-key` or `Authorization: Bearer`.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let verdict = presented_key(request.headers())
        .map(|key| constant_time_eq(key.as_bytes(), state.api_key().as_bytes()));

    match verdict {
        Some(true) => Ok(next.run(request).await),
        Some(false) => {
            warn!(path = %request.uri().path(), "Rejected request with wrong API key");
            Err(ApiError::unauthorized("Invalid API key"))
        }
        None => Err(ApiError::unauthorized("Missing API key")),
    }
}

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(key);
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_presented_key_sources() {
        let mut headers = HeaderMap::new();
        assert!(presented_key(&headers).is_none());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sk_abc"));
        assert_eq!(presented_key(&headers), Some("sk_abc"));

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("sk_header"));
        assert_eq!(presented_key(&headers), Some("sk_header"));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
