//! Request identity extraction.
//!
//! The limiter never verifies credentials. Identity comes from a
//! [`ClaimsProvider`] that reads claims an upstream authenticator has already
//! checked, optionally overridden by headers set by a trusted proxy. Anything
//! missing falls back to the shared anonymous bucket.

use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::trace;

/// Organization id used when none can be determined.
pub const DEFAULT_ORGANIZATION: &str = "default-org";
/// User id used when none can be determined.
pub const DEFAULT_USER: &str = "default-user";
/// IP value used when no client address is available.
pub const UNKNOWN_IP: &str = "unknown";

const ORGANIZATION_HEADER: &str = "x-organization-id";
const USER_HEADER: &str = "x-user-id";
const SESSION_HEADER: &str = "x-session-id";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
const REAL_IP_HEADER: &str = "x-real-ip";
const PRIORITY_HEADER: &str = "x-clinical-priority";

/// Identity and metadata for one request. Built once, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitContext {
    pub organization_id: String,
    pub user_id: String,
    pub session_id: String,
    pub ip_address: String,
    pub user_agent: String,
    pub clinical_priority: bool,
}

impl RateLimitContext {
    /// Build a context for an identified user with a fixed session and IP.
    pub fn new(organization_id: &str, user_id: &str, session_id: &str, ip_address: &str) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            ip_address: ip_address.to_string(),
            user_agent: String::new(),
            clinical_priority: false,
        }
    }

    /// Mark this context as clinical-priority traffic.
    pub fn with_priority(mut self, clinical_priority: bool) -> Self {
        self.clinical_priority = clinical_priority;
        self
    }
}

/// Claims an upstream authenticator vouches for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Claims {
    #[serde(default, alias = "organizationId", alias = "org_id", alias = "org")]
    pub organization_id: Option<String>,
    #[serde(default, alias = "userId", alias = "sub")]
    pub user_id: Option<String>,
    #[serde(default, alias = "sessionId", alias = "sid")]
    pub session_id: Option<String>,
}

/// Capability for reading already-authenticated identity claims.
pub trait ClaimsProvider: Send + Sync {
    /// Return the caller's claims, or `None` if there are none to read.
    fn claims(&self, headers: &HeaderMap) -> Option<Claims>;
}

/// Reads the payload of a bearer JWT **without** checking its signature.
///
/// Only deploy this behind an authenticator that has already rejected
/// invalid tokens; it trusts whatever the payload says.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustedBearerClaims;

impl ClaimsProvider for TrustedBearerClaims {
    fn claims(&self, headers: &HeaderMap) -> Option<Claims> {
        let auth = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
        let token = auth.strip_prefix("Bearer ").or_else(|| auth.strip_prefix("bearer "))?;
        let payload = token.trim().split('.').nth(1)?;

        let bytes = match URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')) {
            Ok(bytes) => bytes,
            Err(e) => {
                trace!(error = %e, "Bearer payload is not base64url");
                return None;
            }
        };

        match serde_json::from_slice::<Claims>(&bytes) {
            Ok(claims) => Some(claims),
            Err(e) => {
                trace!(error = %e, "Bearer payload is not a claims object");
                None
            }
        }
    }
}

/// Provider for deployments with no token-borne identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoClaims;

impl ClaimsProvider for NoClaims {
    fn claims(&self, _headers: &HeaderMap) -> Option<Claims> {
        None
    }
}

/// Derives a [`RateLimitContext`] from request headers. Never fails.
#[derive(Clone)]
pub struct ContextExtractor {
    claims: Arc<dyn ClaimsProvider>,
}

impl std::fmt::Debug for ContextExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextExtractor").finish_non_exhaustive()
    }
}

impl Default for ContextExtractor {
    fn default() -> Self {
        Self::new(Arc::new(TrustedBearerClaims))
    }
}

impl ContextExtractor {
    /// Create an extractor over the given claims capability.
    pub fn new(claims: Arc<dyn ClaimsProvider>) -> Self {
        Self { claims }
    }

    /// Build the context for a request.
    ///
    /// Precedence per field: trusted override header, then claims, then the
    /// anonymous default.
    pub fn extract(&self, headers: &HeaderMap) -> RateLimitContext {
        let claims = self.claims.claims(headers).unwrap_or_default();

        let organization_id = header_str(headers, ORGANIZATION_HEADER)
            .or(non_empty(claims.organization_id))
            .unwrap_or_else(|| DEFAULT_ORGANIZATION.to_string());
        let user_id = header_str(headers, USER_HEADER)
            .or(non_empty(claims.user_id))
            .unwrap_or_else(|| DEFAULT_USER.to_string());
        let session_id = header_str(headers, SESSION_HEADER)
            .or(non_empty(claims.session_id))
            .unwrap_or_else(|| format!("anon-{}", uuid::Uuid::new_v4()));

        let context = RateLimitContext {
            organization_id,
            user_id,
            session_id,
            ip_address: client_ip(headers),
            user_agent: header_str(headers, axum::http::header::USER_AGENT.as_str())
                .unwrap_or_default(),
            clinical_priority: header_str(headers, PRIORITY_HEADER)
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false),
        };

        trace!(
            org = %context.organization_id,
            user = %context.user_id,
            ip = %context.ip_address,
            priority = context.clinical_priority,
            "Extracted rate limit context"
        );

        context
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(name)?.to_str().ok()?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// First hop of `x-forwarded-for`, then `x-real-ip`. Unparseable addresses
/// count as unknown.
fn client_ip(headers: &HeaderMap) -> String {
    let candidate = header_str(headers, FORWARDED_FOR_HEADER)
        .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string()))
        .or_else(|| header_str(headers, REAL_IP_HEADER));

    match candidate.and_then(|ip| ip.parse::<IpAddr>().ok()) {
        Some(ip) => ip.to_string(),
        None => UNKNOWN_IP.to_string(),
    }
}
