//! Core rate limiter implementation.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::backend::{RateLimiterBackend, Verdict};
use super::identity::IdentityKind;
use super::rules::LimitConfig;
use crate::error::{GatekeeperError, Result, StorageOperation};
use crate::storage::Storage;

/// Length of the counting window.
pub const WINDOW: Duration = Duration::from_secs(1);

/// The rate decision engine.
///
/// Holds no mutable state of its own; everything it counts lives in the
/// storage backend, so one instance can be shared across all tasks.
pub struct RateLimiter {
    /// Counter and block storage
    storage: Arc<dyn Storage>,
    /// Limits, fixed for the lifetime of the limiter
    config: LimitConfig,
}

impl RateLimiter {
    /// Create a new rate limiter over `storage`.
    pub fn new(storage: Arc<dyn Storage>, config: LimitConfig) -> Self {
        Self { storage, config }
    }

    /// Check whether a request from `key` is admitted.
    ///
    /// A blocked key is denied before its counter is touched. Otherwise the
    /// request is counted, and the request that pushes the count past the
    /// limit blocks the key.
    pub async fn check(&self, key: &str, kind: IdentityKind) -> Result<Verdict> {
        let storage_key = kind.storage_key(key);

        trace!(key = %key, kind = %kind, "Checking rate limit");

        let blocked = self
            .storage
            .is_blocked(&storage_key)
            .await
            .map_err(|e| GatekeeperError::storage(StorageOperation::IsBlocked, e))?;
        if blocked {
            trace!(key = %key, kind = %kind, "Key is blocked");
            return Ok(Verdict::Deny);
        }

        let limit = self.config.resolve(key, kind);

        let count = self
            .storage
            .increment_count(&storage_key, WINDOW)
            .await
            .map_err(|e| GatekeeperError::storage(StorageOperation::IncrementCount, e))?;

        if count > limit.max_requests {
            self.storage
                .block(&storage_key, limit.block_duration)
                .await
                .map_err(|e| GatekeeperError::storage(StorageOperation::Block, e))?;

            debug!(
                key = %key,
                kind = %kind,
                count = count,
                limit = limit.max_requests,
                block_duration = ?limit.block_duration,
                "Rate limit exceeded, key blocked"
            );
            return Ok(Verdict::Deny);
        }

        Ok(Verdict::Allow)
    }

    /// Requests left for `key` in the current window, without counting one.
    pub async fn remaining_requests(&self, key: &str, kind: IdentityKind) -> Result<u64> {
        let count = self
            .storage
            .get_count(&kind.storage_key(key))
            .await
            .map_err(|e| GatekeeperError::storage(StorageOperation::GetCount, e))?;

        let limit = self.config.resolve(key, kind);
        Ok(limit.max_requests.saturating_sub(count))
    }
}

#[async_trait]
impl RateLimiterBackend for RateLimiter {
    async fn check(&self, key: &str, kind: IdentityKind) -> Result<Verdict> {
        RateLimiter::check(self, key, kind).await
    }

    async fn remaining_requests(&self, key: &str, kind: IdentityKind) -> Result<u64> {
        RateLimiter::remaining_requests(self, key, kind).await
    }
}
