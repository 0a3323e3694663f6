//! In-process counter store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{CounterStore, StoreError};

/// A counter and the instant its window closes.
#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    count: u64,
    expires_at: Instant,
}

/// A counter store held entirely in process memory.
///
/// Increments take the shard lock of the key's map entry, so the read-modify-write
/// and the expiry reset of a fresh window happen as one step. Time comes from
/// `tokio::time`, which lets tests drive windows with a paused clock.
///
/// Expired records are not removed on read; call [`MemoryStore::purge_expired`]
/// periodically to bound memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: DashMap<String, WindowCounter>,
    blocks: DashMap<String, Instant>,
    closed: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count recorded for `key` in its current window, if the window is still open.
    pub fn current_count(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        self.counters
            .get(key)
            .filter(|counter| counter.expires_at > now)
            .map(|counter| counter.count)
    }

    /// Drop every counter and block whose expiry has passed.
    ///
    /// Returns the number of records removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        self.counters.retain(|_, counter| {
            let keep = counter.expires_at > now;
            removed += usize::from(!keep);
            keep
        });
        self.blocks.retain(|_, blocked_until| {
            let keep = *blocked_until > now;
            removed += usize::from(!keep);
            keep
        });

        if removed > 0 {
            debug!(removed = removed, "Purged expired rate limit records");
        }
        removed
    }

    /// Number of counter records held, expired or not.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        self.ensure_open()?;

        let now = Instant::now();
        let count = {
            let mut counter = self
                .counters
                .entry(key.to_string())
                .or_insert(WindowCounter {
                    count: 0,
                    expires_at: now + window,
                });

            if counter.expires_at <= now {
                *counter = WindowCounter {
                    count: 0,
                    expires_at: now + window,
                };
            }
            counter.count += 1;
            counter.count
        };

        trace!(key = %key, count = count, "Incremented counter");
        Ok(count)
    }

    async fn is_blocked(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;

        let now = Instant::now();
        Ok(self
            .blocks
            .get(key)
            .is_some_and(|blocked_until| *blocked_until > now))
    }

    async fn block(&self, key: &str, duration: Duration) -> Result<(), StoreError> {
        self.ensure_open()?;

        self.blocks.insert(key.to_string(), Instant::now() + duration);
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.counters.clear();
            self.blocks.clear();
            debug!("Memory store closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    const WINDOW: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn test_increment_counts_within_window() {
        let store = MemoryStore::new();

        assert_eq!(store.increment("ip:10.0.0.1", WINDOW).await.unwrap(), 1);
        assert_eq!(store.increment("ip:10.0.0.1", WINDOW).await.unwrap(), 2);
        assert_eq!(store.increment("ip:10.0.0.1", WINDOW).await.unwrap(), 3);
        assert_eq!(store.current_count("ip:10.0.0.1"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_resets_after_window() {
        let store = MemoryStore::new();

        store.increment("ip:10.0.0.1", WINDOW).await.unwrap();
        store.increment("ip:10.0.0.1", WINDOW).await.unwrap();

        tokio::time::advance(WINDOW).await;

        assert_eq!(store.current_count("ip:10.0.0.1"), None);
        assert_eq!(store.increment("ip:10.0.0.1", WINDOW).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_is_not_extended_by_later_increments() {
        let store = MemoryStore::new();

        store.increment("k", WINDOW).await.unwrap();
        tokio::time::advance(Duration::from_millis(900)).await;
        assert_eq!(store.increment("k", WINDOW).await.unwrap(), 2);

        // The window opened by the first increment closes here.
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(store.increment("k", WINDOW).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_keys_are_counted_separately() {
        let store = MemoryStore::new();

        store.increment("ip:1.1.1.1", WINDOW).await.unwrap();
        store.increment("ip:1.1.1.1", WINDOW).await.unwrap();
        store.increment("token:1.1.1.1", WINDOW).await.unwrap();

        assert_eq!(store.current_count("ip:1.1.1.1"), Some(2));
        assert_eq!(store.current_count("token:1.1.1.1"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_expires() {
        let store = MemoryStore::new();

        assert!(!store.is_blocked("k").await.unwrap());
        store.block("k", Duration::from_secs(60)).await.unwrap();
        assert!(store.is_blocked("k").await.unwrap());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(store.is_blocked("k").await.unwrap());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!store.is_blocked("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_duration_block_has_no_effect() {
        let store = MemoryStore::new();

        store.block("k", Duration::ZERO).await.unwrap();
        assert!(!store.is_blocked("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryStore::new();

        store.increment("a", WINDOW).await.unwrap();
        store.increment("b", Duration::from_secs(10)).await.unwrap();
        store.block("a", Duration::from_secs(5)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.counter_count(), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(store.purge_expired(), 2);
        assert_eq!(store.counter_count(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_operations() {
        let store = MemoryStore::new();
        store.increment("k", WINDOW).await.unwrap();

        assert_ok!(store.close().await);
        assert_ok!(store.close().await);

        assert!(matches!(
            store.increment("k", WINDOW).await,
            Err(StoreError::Closed)
        ));
        assert_err!(store.is_blocked("k").await);
        assert_err!(store.block("k", WINDOW).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_increments_yield_distinct_counts() {
        const CALLERS: u64 = 200;
        let store = Arc::new(MemoryStore::new());

        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .increment("ip:192.0.2.1", Duration::from_secs(60))
                        .await
                })
            })
            .collect();

        let mut counts: Vec<u64> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();
        counts.sort_unstable();

        assert_eq!(counts, (1..=CALLERS).collect::<Vec<_>>());
    }
}
