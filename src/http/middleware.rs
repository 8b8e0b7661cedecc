//! Request rate limiting middleware.
//!
//! Reads the caller identity from `X-Tenant-ID` and `X-User-ID`, which an
//! upstream authentication layer is expected to set. Requests without a
//! tenant are not limited; identity headers that are not visible ASCII are
//! rejected with 400.
//!
//! Adds rate limit headers to every limited response:
//! - `X-RateLimit-Limit`: maximum requests allowed in the window
//! - `X-RateLimit-Remaining`: requests remaining in the window
//! - `X-RateLimit-Reset`: Unix timestamp when the window frees up

use axum::{
    extract::{OriginalUri, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{info, warn};

use super::error::ApiError;
use super::AppState;
use crate::error::LimiterError;
use crate::ratelimit::{CheckRequest, RateLimitResult};

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const USER_HEADER: &str = "x-user-id";

static LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

pub(crate) fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Like [`header_value`], but a present header that is not visible ASCII is
/// an error rather than absent.
fn identity_header(headers: &HeaderMap, name: &str) -> Result<Option<String>, LimiterError> {
    match headers.get(name) {
        Some(value) if value.to_str().is_err() => {
            warn!(header = name, "Rejecting request with non-ASCII identity header");
            Err(LimiterError::Validation(format!(
                "{} header must be visible ASCII",
                name
            )))
        }
        _ => Ok(header_value(headers, name)),
    }
}

pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let identity = identity_header(request.headers(), TENANT_HEADER).and_then(|tenant| {
        Ok((tenant, identity_header(request.headers(), USER_HEADER)?))
    });
    let (tenant_id, user_id) = match identity {
        Ok((Some(tenant_id), user_id)) => (tenant_id, user_id),
        Ok((None, _)) => return next.run(request).await,
        Err(e) => return ApiError::from(e).into_response(),
    };

    // Nested routers see the path with their prefix stripped.
    let path = match request.extensions().get::<OriginalUri>() {
        Some(OriginalUri(uri)) => uri.path().to_string(),
        None => request.uri().path().to_string(),
    };
    let check = CheckRequest {
        tenant_id,
        user_id,
        endpoint: path.clone(),
        method: request.method().as_str().to_string(),
    };
    let policy = state.config.failure_policy_for(&path);

    match state.limiter.check(&check, policy).await {
        Ok(result) if result.allowed => {
            let mut response = next.run(request).await;
            add_rate_limit_headers(response.headers_mut(), &result);
            response
        }
        Ok(result) => too_many_requests(&check, &result),
        Err(e) => ApiError::from(e).into_response(),
    }
}

fn too_many_requests(check: &CheckRequest, result: &RateLimitResult) -> Response {
    let retry_after = result.retry_after_secs().unwrap_or(1);

    info!(
        tenant_id = %check.tenant_id,
        user_id = check.user_id.as_deref().unwrap_or(""),
        endpoint = %check.endpoint,
        limit = result.limit,
        retry_after,
        "Request rejected by rate limit"
    );

    let body = json!({
        "error": "rate_limit_exceeded",
        "message": format!("Rate limit exceeded. Try again in {} seconds.", retry_after),
        "limit": result.limit,
        "current_usage": result.current_usage,
        "retry_after": retry_after,
        "scope": result.scope,
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    add_rate_limit_headers(response.headers_mut(), result);
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

/// Bypassed and fail-open results enforce nothing and get no headers.
fn add_rate_limit_headers(headers: &mut HeaderMap, result: &RateLimitResult) {
    if result.scope.is_none() {
        return;
    }
    headers.insert(LIMIT_HEADER.clone(), HeaderValue::from(result.limit));
    headers.insert(REMAINING_HEADER.clone(), HeaderValue::from(result.remaining));
    headers.insert(RESET_HEADER.clone(), HeaderValue::from(result.reset_at));
}
