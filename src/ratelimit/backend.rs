//! Rate limiter trait consumed by the admission middleware.

use async_trait::async_trait;

use super::identity::IdentityKind;
use crate::error::Result;

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

/// Trait for rate limiter implementations.
///
/// The HTTP layer depends on this rather than on `RateLimiter` directly so it
/// can be driven by a stub in tests.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Decide whether a request from `key` may proceed, counting it if so.
    async fn check(&self, key: &str, kind: IdentityKind) -> Result<Verdict>;

    /// Requests left for `key` in the current window. Advisory only.
    async fn remaining_requests(&self, key: &str, kind: IdentityKind) -> Result<u64>;
}
