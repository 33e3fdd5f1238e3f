//! Counter and block storage backends.
//!
//! - **Memory**: a single-process store behind one read/write lock
//! - **Redis**: a networked store using native TTLs and atomic increments

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisOptions, RedisStore};

use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

use crate::error::{GatekeeperError, Result, StorageOperation};
pub use crate::error::StorageUnavailable;

/// Result type for storage calls.
pub type StorageResult<T> = std::result::Result<T, StorageUnavailable>;

/// Trait for rate limit storage backends.
///
/// A key owns at most one live counter and at most one live block, and the
/// two expire on independent clocks. Expired entries must read as absent
/// whether or not they have been physically removed.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Current count for the live window, or 0 if there is none.
    async fn get_count(&self, key: &str) -> StorageResult<u64>;

    /// Atomically add one to the key's counter and return the new count.
    ///
    /// The first increment of a window arms its expiry to `window` from now.
    async fn increment_count(&self, key: &str, window: Duration) -> StorageResult<u64>;

    /// Whether a live block exists for the key.
    async fn is_blocked(&self, key: &str) -> StorageResult<bool>;

    /// Block the key for `duration`, replacing any existing block.
    async fn block(&self, key: &str, duration: Duration) -> StorageResult<()>;

    /// Release held resources. Called once, when the owner shuts down.
    async fn close(&self) -> StorageResult<()>;

    /// Backend name for logging.
    fn name(&self) -> &'static str;
}

/// Close `storage` at shutdown, naming the step in any failure.
pub async fn shutdown(storage: &dyn Storage) -> Result<()> {
    storage
        .close()
        .await
        .map_err(|e| GatekeeperError::storage(StorageOperation::Close, e))?;

    info!(backend = storage.name(), "Storage closed");
    Ok(())
}
