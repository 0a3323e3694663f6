//! Redis-backed counter store.
//!
//! Counters live under `{prefix}{key}` and blocks under `{prefix}blocked:{key}`,
//! both expiring through Redis TTLs. The increment and the first-write expiry run
//! inside one Lua script, so no caller can observe a counter without a TTL.

use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, info, trace};

use super::{CounterStore, StoreError};

/// Increment a counter and attach the window TTL when the window is fresh.
///
/// A counter left without a TTL (PTTL == -1) is also given one, so a key can
/// never outlive its window.
static INCREMENT_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local count = redis.call('INCR', KEYS[1])
if count == 1 or redis.call('PTTL', KEYS[1]) == -1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
",
    )
});

/// Configuration for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix prepended to every key written (default: empty)
    pub key_prefix: String,
    /// Upper bound for a single Redis round trip (default: 2s)
    pub timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            timeout: Duration::from_secs(2),
        }
    }
}

/// Counter store shared across instances through Redis.
pub struct RedisStore {
    /// `None` once the store has been closed.
    connection: RwLock<Option<ConnectionManager>>,
    config: RedisStoreConfig,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis with default configuration.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect to Redis with custom configuration.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = tokio::time::timeout(config.timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(config.timeout))??;

        info!(prefix = %config.key_prefix, "Connected to Redis counter store");

        Ok(Self {
            connection: RwLock::new(Some(connection)),
            config,
        })
    }

    /// Build a `redis://` URL from the address, password and database number.
    pub fn url(addr: &str, password: &str, db: i64) -> String {
        if password.is_empty() {
            format!("redis://{}/{}", addr, db)
        } else {
            format!("redis://:{}@{}/{}", password, addr, db)
        }
    }

    fn counter_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn block_key(&self, key: &str) -> String {
        format!("{}blocked:{}", self.config.key_prefix, key)
    }

    fn connection(&self) -> Result<ConnectionManager, StoreError> {
        self.connection.read().clone().ok_or(StoreError::Closed)
    }

    async fn with_timeout<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        tokio::time::timeout(self.config.timeout, op)
            .await
            .map_err(|_| StoreError::Timeout(self.config.timeout))?
            .map_err(StoreError::from)
    }
}

/// Redis expiry arguments are whole milliseconds; round sub-millisecond windows up.
fn as_millis(duration: Duration) -> u64 {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    if millis == 0 && !duration.is_zero() {
        1
    } else {
        millis
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let mut conn = self.connection()?;
        let redis_key = self.counter_key(key);

        let mut invocation = INCREMENT_SCRIPT.key(&redis_key);
        invocation.arg(as_millis(window));
        let count: u64 = self
            .with_timeout(invocation.invoke_async(&mut conn))
            .await?;

        trace!(key = %redis_key, count = count, "Incremented counter");
        Ok(count)
    }

    async fn is_blocked(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let block_key = self.block_key(key);

        self.with_timeout(
            redis::cmd("EXISTS")
                .arg(&block_key)
                .query_async::<bool>(&mut conn),
        )
        .await
    }

    async fn block(&self, key: &str, duration: Duration) -> Result<(), StoreError> {
        // PX 0 is rejected by Redis; a zero-length block is simply never written.
        if duration.is_zero() {
            return Ok(());
        }

        let mut conn = self.connection()?;
        let block_key = self.block_key(key);

        self.with_timeout(
            redis::cmd("SET")
                .arg(&block_key)
                .arg("1")
                .arg("PX")
                .arg(as_millis(duration))
                .query_async::<()>(&mut conn),
        )
        .await?;

        debug!(key = %block_key, duration = ?duration, "Block written");
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.connection.write().take().is_some() {
            info!("Redis counter store closed");
        }
        Ok(())
    }
}
