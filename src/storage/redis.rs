//! Redis storage backend.

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, RedisResult, Script};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

use super::{Storage, StorageResult, StorageUnavailable};

/// Increments the counter and arms its expiry as one unit of work.
///
/// The expiry is armed on the first increment of a window, and whenever the
/// key has somehow been left without a TTL.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 or redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisOptions {
    /// Prepended to every key written by this store
    pub key_prefix: String,
    /// Upper bound for establishing the initial connection
    pub connect_timeout: Duration,
    /// Upper bound for each round trip
    pub operation_timeout: Duration,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            key_prefix: "gatekeeper:".to_string(),
            connect_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_millis(500),
        }
    }
}

/// Storage backed by a Redis server.
pub struct RedisStore {
    /// `None` once the store has been closed. Only ever locked to clone the handle.
    connection: RwLock<Option<ConnectionManager>>,
    increment: Script,
    options: RedisOptions,
}

impl RedisStore {
    /// Connect to `url` and verify the server answers.
    ///
    /// Fails instead of returning a store that cannot reach its server.
    pub async fn connect(url: &str, options: RedisOptions) -> StorageResult<Self> {
        let client = redis::Client::open(url)?;

        let connecting = async {
            let mut connection = ConnectionManager::new(client).await?;
            let _: String = redis::cmd("PING").query_async(&mut connection).await?;
            Ok::<_, RedisError>(connection)
        };

        let connection = tokio::time::timeout(options.connect_timeout, connecting)
            .await
            .map_err(|elapsed| {
                StorageUnavailable::with_source(
                    format!(
                        "could not connect within {}",
                        humantime::format_duration(options.connect_timeout)
                    ),
                    elapsed,
                )
            })??;

        info!(key_prefix = %options.key_prefix, "Connected to Redis");

        Ok(Self {
            connection: RwLock::new(Some(connection)),
            increment: Script::new(INCREMENT_SCRIPT),
            options,
        })
    }

    /// A store that has already been closed, for exercising that path without a server.
    #[cfg(test)]
    fn closed(options: RedisOptions) -> Self {
        Self {
            connection: RwLock::new(None),
            increment: Script::new(INCREMENT_SCRIPT),
            options,
        }
    }

    fn connection(&self) -> StorageResult<ConnectionManager> {
        self.connection
            .read()
            .clone()
            .ok_or_else(|| StorageUnavailable::new("store is closed"))
    }
}

/// Run one round trip, giving up after `limit`.
async fn bounded<T, F>(limit: Duration, call: F) -> StorageResult<T>
where
    F: Future<Output = RedisResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(StorageUnavailable::from),
        Err(elapsed) => Err(StorageUnavailable::with_source(
            format!("redis call exceeded {}", humantime::format_duration(limit)),
            elapsed,
        )),
    }
}

fn count_key(prefix: &str, key: &str) -> String {
    format!("{}count:{}", prefix, key)
}

fn block_key(prefix: &str, key: &str) -> String {
    format!("{}blocked:{}", prefix, key)
}

/// Redis TTLs are whole milliseconds; sub-millisecond windows round up.
fn ttl_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl From<RedisError> for StorageUnavailable {
    fn from(err: RedisError) -> Self {
        StorageUnavailable::with_source("redis request failed", err)
    }
}

#[async_trait]
impl Storage for RedisStore {
    async fn get_count(&self, key: &str) -> StorageResult<u64> {
        let mut connection = self.connection()?;
        let key = count_key(&self.options.key_prefix, key);

        let count: Option<u64> =
            bounded(self.options.operation_timeout, connection.get(&key)).await?;
        Ok(count.unwrap_or(0))
    }

    async fn increment_count(&self, key: &str, window: Duration) -> StorageResult<u64> {
        let mut connection = self.connection()?;
        let key = count_key(&self.options.key_prefix, key);

        let mut invocation = self.increment.prepare_invoke();
        invocation.key(&key).arg(ttl_millis(window));

        bounded(
            self.options.operation_timeout,
            invocation.invoke_async(&mut connection),
        )
        .await
    }

    async fn is_blocked(&self, key: &str) -> StorageResult<bool> {
        let mut connection = self.connection()?;
        let key = block_key(&self.options.key_prefix, key);

        bounded(self.options.operation_timeout, connection.exists(&key)).await
    }

    async fn block(&self, key: &str, duration: Duration) -> StorageResult<()> {
        if duration.is_zero() {
            // A zero-length block has already expired.
            return Ok(());
        }

        let mut connection = self.connection()?;
        let key = block_key(&self.options.key_prefix, key);

        bounded(
            self.options.operation_timeout,
            connection.pset_ex(&key, 1, ttl_millis(duration)),
        )
        .await
    }

    async fn close(&self) -> StorageResult<()> {
        if self.connection.write().take().is_some() {
            debug!("Closed Redis connection");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
