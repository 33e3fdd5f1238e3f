//! Per-identity limit configuration and resolution.

use std::collections::HashMap;
use std::time::Duration;

use super::identity::IdentityKind;

/// Default cap on requests per window.
pub const DEFAULT_MAX_REQUESTS: u64 = 10;
/// Default time an over-limit identity stays blocked.
pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(5 * 60);
/// Default header carrying the API token.
pub const DEFAULT_TOKEN_HEADER: &str = "API_KEY";

/// Limits applied to one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenLimit {
    /// Maximum requests allowed in one window
    pub max_requests: u64,
    /// How long the identity is blocked once it exceeds `max_requests`
    pub block_duration: Duration,
}

impl TokenLimit {
    pub fn new(max_requests: u64, block_duration: Duration) -> Self {
        Self {
            max_requests,
            block_duration,
        }
    }
}

/// Limit configuration consumed by the rate limiter.
///
/// Built once at startup and never mutated afterwards; a change in limits
/// means building a new limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitConfig {
    /// Cap for identities without an override
    pub default_max_requests: u64,
    /// Block length for identities without an override
    pub default_block_duration: Duration,
    /// Request header carrying the token identity
    pub identity_header: String,
    /// Overrides keyed by token value. Never consulted for IP identities.
    pub token_limits: HashMap<String, TokenLimit>,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            default_max_requests: DEFAULT_MAX_REQUESTS,
            default_block_duration: DEFAULT_BLOCK_DURATION,
            identity_header: DEFAULT_TOKEN_HEADER.to_string(),
            token_limits: HashMap::new(),
        }
    }
}

impl LimitConfig {
    pub fn new(default_max_requests: u64, default_block_duration: Duration) -> Self {
        Self {
            default_max_requests,
            default_block_duration,
            ..Self::default()
        }
    }

    /// Set the header the token identity is read from.
    pub fn with_identity_header(mut self, header: impl Into<String>) -> Self {
        self.identity_header = header.into();
        self
    }

    /// Add or replace the override for `token`.
    pub fn with_token_limit(
        mut self,
        token: impl Into<String>,
        max_requests: u64,
        block_duration: Duration,
    ) -> Self {
        self.token_limits
            .insert(token.into(), TokenLimit::new(max_requests, block_duration));
        self
    }

    /// The defaults as a limit pair.
    pub fn default_limit(&self) -> TokenLimit {
        TokenLimit::new(self.default_max_requests, self.default_block_duration)
    }

    /// Find the limits that apply to `key`.
    ///
    /// Token identities with an override get it; every other identity gets
    /// the defaults.
    pub fn resolve(&self, key: &str, kind: IdentityKind) -> TokenLimit {
        match kind {
            IdentityKind::Token => self
                .token_limits
                .get(key)
                .copied()
                .unwrap_or_else(|| self.default_limit()),
            IdentityKind::Ip => self.default_limit(),
        }
    }
}
