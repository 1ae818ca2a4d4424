use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::GatewayError;
use crate::state::AppState;

/// Who made the request, attached as a request extension by [`auth_middleware`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    /// Authentication is disabled.
    Anonymous,
    /// Index of the matching entry in `auth.tokens`.
    Token(usize),
}

/// Bearer token (or `X-API-Key`) check against the configured token list.
pub async fn auth_middleware(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let tokens = &state.config.auth.tokens;
    let identity = if tokens.is_empty() {
        Identity::Anonymous
    } else {
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .or_else(|| request.headers().get("x-api-key").and_then(|v| v.to_str().ok()))
            .map(str::trim);
        match presented {
            Some(key) if !key.is_empty() => match match_token(tokens, key) {
                Some(idx) => Identity::Token(idx),
                None => {
                    warn!(path = %request.uri().path(), "rejected request with unknown token");
                    return GatewayError::Unauthorized("Unauthorized access").into_response();
                }
            },
            _ => return GatewayError::Unauthorized("Authorization token missing or invalid").into_response(),
        }
    };
    request.extensions_mut().insert(identity);
    next.run(request).await
}

/// Index of the token equal to `key`. Every token is compared through its
/// SHA-256 digest, so timing depends neither on token lengths nor on the
/// position of the match.
fn match_token(tokens: &[String], key: &str) -> Option<usize> {
    let presented = Sha256::digest(key.as_bytes());
    tokens.iter().enumerate().fold(None, |found, (idx, token)| {
        let equal = digest_eq(&Sha256::digest(token.as_bytes()), &presented);
        found.or(equal.then_some(idx))
    })
}

fn digest_eq(a: &[u8], b: &[u8]) -> bool {
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
