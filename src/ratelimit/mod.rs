//! Rate limiting logic: request identity, tiers and the multi-tier limiter.

mod context;
mod key;
mod limiter;
mod tier;

pub use context::{
    Claims, ClaimsProvider, ContextExtractor, NoClaims, RateLimitContext, TrustedBearerClaims,
    DEFAULT_ORGANIZATION, DEFAULT_USER, UNKNOWN_IP,
};
pub use key::CounterKey;
pub use limiter::{RateLimitResult, RateLimiter, TierStatus};
pub use tier::{LimitsConfig, Scope, TierConfig};
