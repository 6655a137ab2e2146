//! HTTP adapter: axum middleware and the health endpoint.

mod health;
mod middleware;

pub use health::{health, HealthResponse, RateLimiterHealth};
pub use middleware::{
    insert_limit_headers, rate_limit, RateLimitRejection, X_ABUSE_DETECTED, X_ABUSE_RISK_LEVEL,
    X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};

use axum::routing::get;
use axum::Router;
use std::sync::Arc;

use crate::service::RateLimitService;

/// Put every route of `app` behind the rate limiter and add `GET /health`,
/// which is not rate limited.
pub fn protect(app: Router, service: Arc<RateLimitService>) -> Router {
    app.layer(axum::middleware::from_fn_with_state(service.clone(), rate_limit))
        .merge(Router::new().route("/health", get(health)).with_state(service))
}
