//! Authentication middleware for API key validation.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use billing_types::BillingRepository;

use super::handlers::AppState;
use crate::security::verify_api_key;

/// Extracts the API key from the Authorization header.
/// Expected format: "Bearer <api_key>" or just "<api_key>"
fn extract_api_key(auth_header: Option<&str>) -> Option<&str> {
    let header = auth_header?.trim_start();
    let key = header.strip_prefix("Bearer ").unwrap_or(header).trim();
    if key.is_empty() || key == "Bearer" {
        return None;
    }
    Some(key)
}

/// Paths that authenticate some other way, or not at all.
fn is_public(path: &str) -> bool {
    path == "/health" || path.starts_with("/webhooks/") || path.starts_with("/api-docs/")
}

/// Authentication middleware that validates API keys.
///
/// The key is hashed with SHA-256 and compared, in constant time, against
/// the configured key hashes. Provider webhooks carry signatures instead and
/// bypass this check, as do the health check and the OpenAPI document.
pub async fn auth_middleware<R: BillingRepository>(
    State(state): State<Arc<AppState<R>>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if is_public(request.uri().path()) {
        return next.run(request).await;
    }

    let auth_header = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok());

    let Some(api_key) = extract_api_key(auth_header) else {
        return unauthorized_response("Missing or invalid Authorization header");
    };

    let known = state
        .api_key_hashes
        .iter()
        .any(|hash| verify_api_key(api_key, hash));
    if known {
        next.run(request).await
    } else {
        tracing::warn!(security = true, path = %request.uri().path(), "Rejected API key");
        unauthorized_response("Invalid API key")
    }
}

fn unauthorized_response(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "error": message,
            "code": 401
        })),
    )
        .into_response()
}
