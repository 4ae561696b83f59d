//! Bearer-token check for the dashboard API.

use axum::{
    Json,
    extract::{Query, Request, State},
    http::{StatusCode, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Response},
};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::warn;

use super::AppState;

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Reject requests without the configured token.
///
/// Accepts `Authorization: Bearer <token>` or, for WebSocket upgrades from a
/// browser, a `token` query parameter.
pub(super) async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(ref secret) = state.app_secret else {
        return next.run(request).await;
    };

    let header_token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let query_token = Query::<TokenQuery>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(q)| q.token);

    let authorized = header_token
        .or(query_token.as_deref())
        .is_some_and(|token| constant_time_eq(token.as_bytes(), secret.expose_secret().as_bytes()));

    if authorized {
        return next.run(request).await;
    }
    warn!(path = %request.uri().path(), "Rejected unauthenticated request");
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": "missing or invalid bearer token"})),
    )
        .into_response()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_comparison() {
        assert!(constant_time_eq(b"s3cret", b"s3cret"));
        assert!(!constant_time_eq(b"s3cret", b"s3creT"));
        assert!(!constant_time_eq(b"s3cret", b"s3cret!"));
        assert!(!constant_time_eq(b"", b"x"));
    }
}
