//! Rate limit middleware for axum routers.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::ratelimit::RateLimitResult;
use crate::service::{Decision, RateLimitService};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_ABUSE_DETECTED: HeaderName = HeaderName::from_static("x-abuse-detected");
pub const X_ABUSE_RISK_LEVEL: HeaderName = HeaderName::from_static("x-abuse-risk-level");

/// Rate limit every request passing through this layer.
///
/// Install with `axum::middleware::from_fn_with_state(service, rate_limit)`.
/// Denied requests never reach the inner handler.
pub async fn rate_limit(
    State(service): State<Arc<RateLimitService>>,
    request: Request,
    next: Next,
) -> Response {
    let decision = service.check(request.headers()).await;
    if !decision.allowed() {
        return RateLimitRejection::from(decision).into_response();
    }

    let mut response = next.run(request).await;
    insert_limit_headers(response.headers_mut(), &decision.result);
    response
}

/// Set `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`.
pub fn insert_limit_headers(headers: &mut HeaderMap, result: &RateLimitResult) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(result.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(result.remaining));
    let reset = result.reset_at.to_rfc3339_opts(SecondsFormat::Secs, true);
    if let Ok(value) = HeaderValue::from_str(&reset) {
        headers.insert(X_RATELIMIT_RESET, value);
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RejectionBody {
    error: &'static str,
    message: String,
    retry_after: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    abuse_warning: Option<String>,
}

/// The 429 response for a denied request.
#[derive(Debug)]
pub struct RateLimitRejection {
    decision: Decision,
    retry_after: u64,
}

impl From<Decision> for RateLimitRejection {
    fn from(decision: Decision) -> Self {
        let retry_after = decision.result.retry_after_secs(Utc::now());
        Self {
            decision,
            retry_after,
        }
    }
}

impl IntoResponse for RateLimitRejection {
    fn into_response(self) -> Response {
        let result = &self.decision.result;
        let abuse = self.decision.abuse.as_ref().filter(|a| a.is_abuse);

        let mut headers = HeaderMap::new();
        insert_limit_headers(&mut headers, result);
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u64));
        headers.insert(
            axum::http::header::RETRY_AFTER,
            HeaderValue::from(self.retry_after),
        );
        if let Some(abuse) = abuse {
            headers.insert(X_ABUSE_DETECTED, HeaderValue::from_static("true"));
            headers.insert(X_ABUSE_RISK_LEVEL, HeaderValue::from_static(abuse.risk_level.as_str()));
        }

        let message = match &result.denied_by {
            Some(tier) => format!(
                "Too many requests: the {} limit of {} was exceeded. Retry in {} seconds.",
                tier, result.limit, self.retry_after
            ),
            None => format!("Too many requests. Retry in {} seconds.", self.retry_after),
        };

        let body = RejectionBody {
            error: "Rate limit exceeded",
            message,
            retry_after: self.retry_after,
            abuse_warning: abuse.and_then(|a| a.warning()),
        };

        (StatusCode::TOO_MANY_REQUESTS, headers, Json(body)).into_response()
    }
}
