//! `/health` endpoint.

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::service::RateLimitService;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterHealth {
    pub provider: String,
    pub redis_connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `healthy`, or `degraded` while counting in-process
    pub status: &'static str,
    pub rate_limiter: RateLimiterHealth,
}

/// Report rate limiter health. Always 200: a degraded limiter still
/// enforces limits.
pub async fn health(State(service): State<Arc<RateLimitService>>) -> Json<HealthResponse> {
    let status = service.status();
    Json(HealthResponse {
        status: if status.redis_connected { "healthy" } else { "degraded" },
        rate_limiter: RateLimiterHealth {
            provider: status.provider,
            redis_connected: status.redis_connected,
        },
    })
}
