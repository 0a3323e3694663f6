//! Counter storage behind the decision engine.
//!
//! The engine never holds per-subject state itself. Counters and blocks live in a
//! [`CounterStore`], which is responsible for atomic increments and for expiring
//! both kinds of record on its own.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::{RedisStore, RedisStoreConfig};

/// Errors raised by a counter store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis command failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Store is closed")]
    Closed,
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Key-value capability the decision engine is built on.
///
/// Implementations must serialize increments per key so that concurrent callers
/// observe distinct, gap-free counts, and must set the window expiry in the same
/// atomic step as the first increment of a window.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter for `key` and return the post-increment count.
    ///
    /// The first increment of a fresh window makes the counter expire after `window`.
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, StoreError>;

    /// Whether an unexpired block exists for `key`.
    async fn is_blocked(&self, key: &str) -> Result<bool, StoreError>;

    /// Create or overwrite a block for `key` that expires after `duration`.
    async fn block(&self, key: &str, duration: Duration) -> Result<(), StoreError>;

    /// Release backend resources. Calling it more than once is a no-op.
    async fn close(&self) -> Result<(), StoreError>;
}
