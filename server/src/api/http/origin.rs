//! Browser origin checks
//!
//! The bridge spawns shells, so a page in the user's browser must not be able
//! to reach it unless its origin is configured. Requests without an `Origin`
//! header (CLI tools, agents) are not browser cross-origin requests and pass.

use axum::{
    extract::{Request, State},
    http::{header, HeaderName, HeaderValue, Method},
    middleware::Next,
    response::Response,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

use super::mcp::SESSION_HEADER;
use crate::{AppState, Error, Result};

/// CORS layer answering only for the configured origins
pub fn cors_layer(allowed: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring malformed allowed origin {:?}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(SESSION_HEADER)])
}

/// Refuse requests, WebSocket upgrades included, from unlisted origins
pub async fn require_allowed_origin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response> {
    if let Some(origin) = request.headers().get(header::ORIGIN) {
        let origin = String::from_utf8_lossy(origin.as_bytes());
        if !is_allowed(&state.config.allowed_origins, &origin) {
            warn!("Refusing {} {} from origin {}", request.method(), request.uri(), origin);
            return Err(Error::OriginNotAllowed(origin.into_owned()));
        }
    }
    Ok(next.run(request).await)
}

fn is_allowed(allowed: &[String], origin: &str) -> bool {
    allowed.iter().any(|entry| entry == origin)
}
