// =============================================================================
// Bearer Token Authentication — Axum Middleware
// =============================================================================
//
// The control plane's own request routing/validation/auth is an external
// concern (spec §1) — the only thing this crate owns is translating an
// authenticated caller into the `TenantId` every `EngineManager` call needs.
// A caller's bearer token *is* its tenant id; comparison against the admin
// token (for `/ws/admin`) stays constant-time, same idiom as the teacher's
// `AURORA_ADMIN_TOKEN` check.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::types::TenantId;

/// Compare two byte slices in constant time. Returns `true` if identical.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Rejection type returned when authentication fails.
pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Extracts the caller's tenant identity from `Authorization: Bearer <token>`.
/// The token is used verbatim as the `TenantId` — per-tenant credential
/// issuance is an external concern this crate does not own.
pub struct TenantAuth(pub TenantId);

impl<S> FromRequestParts<S> for TenantAuth
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match bearer_token(parts) {
            Some(token) if !token.is_empty() => Ok(TenantAuth(TenantId::new(token))),
            _ => {
                warn!("missing or malformed Authorization header");
                Err(AuthRejection { status: StatusCode::UNAUTHORIZED, message: "missing or invalid authorization token" })
            }
        }
    }
}

/// Extracts and validates an admin caller against the `ADMIN_TOKEN`
/// environment variable. Used only by `/ws/admin`.
pub struct AdminAuth;

impl<S> FromRequestParts<S> for AdminAuth
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = std::env::var("ADMIN_TOKEN").unwrap_or_default();
        if expected.is_empty() {
            warn!("ADMIN_TOKEN is not set — admin endpoints are unreachable");
            return Err(AuthRejection { status: StatusCode::FORBIDDEN, message: "server admin auth not configured" });
        }

        match bearer_token(parts) {
            Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(AdminAuth),
            _ => {
                warn!("invalid admin token presented");
                Err(AuthRejection { status: StatusCode::FORBIDDEN, message: "invalid authorization token" })
            }
        }
    }
}

/// Validate a raw token string against `ADMIN_TOKEN` — used for the
/// WebSocket upgrade path, where tokens arrive as a query parameter rather
/// than a header.
pub fn validate_admin_token(token: &str) -> bool {
    let expected = std::env::var("ADMIN_TOKEN").unwrap_or_default();
    !expected.is_empty() && constant_time_eq(token.as_bytes(), expected.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_identical() {
        assert!(constant_time_eq(b"hello", b"hello"));
    }

    #[test]
    fn constant_time_eq_different() {
        assert!(!constant_time_eq(b"hello", b"world"));
    }

    #[test]
    fn constant_time_eq_different_lengths() {
        assert!(!constant_time_eq(b"short", b"longer_string"));
    }

    #[test]
    fn validate_admin_token_rejects_when_unset() {
        std::env::remove_var("ADMIN_TOKEN");
        assert!(!validate_admin_token("anything"));
    }
}
