use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use overdrop_domain::Tenant;

use crate::state::AppState;

/// Header naming the tenant a request acts for. Absent in single-tenant
/// installations; the gateway in front of this service sets it after
/// authentication.
pub const TENANT_HEADER: &str = "x-overdrop-tenant";

/// Header naming the calling device on the device API. Set by the gateway
/// from the device's credentials.
pub const DEVICE_HEADER: &str = "x-overdrop-device";

/// Axum middleware that requires a valid `Authorization: Bearer <token>` header.
///
/// Returns 401 for missing, malformed, or incorrect tokens.
/// Applied to all routes — no public endpoints.
pub async fn require_bearer_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == state.auth_token.as_str() => next.run(request).await,
        _ => (StatusCode::UNAUTHORIZED, "Unauthorized\n").into_response(),
    }
}

/// The tenant a request is scoped to.
pub fn request_tenant(headers: &axum::http::HeaderMap) -> Tenant {
    headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(Tenant::new)
        .unwrap_or_else(Tenant::single)
}
