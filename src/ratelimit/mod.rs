//! Rate limiting logic: identity resolution, limit rules and the admission decision.

mod backend;
mod identity;
mod limiter;
mod rules;

pub use backend::{RateLimiterBackend, Verdict};
pub use identity::{Identity, IdentityKind, IdentityResolver};
pub use limiter::{RateLimiter, WINDOW};
pub use rules::{
    LimitConfig, TokenLimit, DEFAULT_BLOCK_DURATION, DEFAULT_MAX_REQUESTS, DEFAULT_TOKEN_HEADER,
};
