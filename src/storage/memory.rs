//! In-process storage backend.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::{Storage, StorageResult};

/// Minimum time between sweeps of expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Request tally for one key within its current window.
#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    expires_at: Instant,
}

impl CounterEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Default)]
struct Entries {
    counters: HashMap<String, CounterEntry>,
    blocks: HashMap<String, Instant>,
    last_sweep: Option<Instant>,
}

impl Entries {
    /// Drop every expired counter and block, at most once per [`SWEEP_INTERVAL`].
    fn sweep(&mut self, now: Instant) {
        if self
            .last_sweep
            .is_some_and(|last| now.duration_since(last) < SWEEP_INTERVAL)
        {
            return;
        }

        let counters = self.counters.len();
        let blocks = self.blocks.len();
        self.counters.retain(|_, entry| entry.is_live(now));
        self.blocks.retain(|_, until| now < *until);
        self.last_sweep = Some(now);

        let evicted = (counters - self.counters.len()) + (blocks - self.blocks.len());
        if evicted > 0 {
            debug!(evicted, "Swept expired entries");
        }
    }
}

/// Storage kept in process memory.
///
/// Counters and blocks share one lock: lookups take it shared, every
/// mutation takes it exclusively for a single short section. Mutations
/// also sweep out expired entries once per [`SWEEP_INTERVAL`], so keys that
/// are never seen again do not accumulate.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<Entries>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of counter records held, live or not.
    pub fn counter_count(&self) -> usize {
        self.entries.read().counters.len()
    }

    /// Number of block records held, live or not.
    pub fn block_count(&self) -> usize {
        self.entries.read().blocks.len()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn get_count(&self, key: &str) -> StorageResult<u64> {
        let now = Instant::now();
        let entries = self.entries.read();

        Ok(entries
            .counters
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map_or(0, |entry| entry.count))
    }

    async fn increment_count(&self, key: &str, window: Duration) -> StorageResult<u64> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        entries.sweep(now);

        match entries.counters.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.count += 1;
                Ok(entry.count)
            }
            // Absent and expired are the same case: start a fresh window.
            _ => {
                entries.counters.insert(
                    key.to_string(),
                    CounterEntry {
                        count: 1,
                        expires_at: now + window,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn is_blocked(&self, key: &str) -> StorageResult<bool> {
        let now = Instant::now();

        {
            let entries = self.entries.read();
            match entries.blocks.get(key) {
                None => return Ok(false),
                Some(until) if now < *until => return Ok(true),
                Some(_) => {}
            }
        }

        // Expired: evict, unless a fresh block landed after the read lock was dropped.
        let mut entries = self.entries.write();
        if entries.blocks.get(key).is_some_and(|until| *until <= now) {
            entries.blocks.remove(key);
            debug!(key = %key, "Evicted expired block");
        }

        Ok(false)
    }

    async fn block(&self, key: &str, duration: Duration) -> StorageResult<()> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        entries.sweep(now);
        entries.blocks.insert(key.to_string(), now + duration);
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        let mut entries = self.entries.write();
        entries.counters.clear();
        entries.blocks.clear();
        entries.last_sweep = None;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WINDOW: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_unseen_key_is_empty() {
        let store = MemoryStore::new();

        assert_eq!(store.get_count("ip:10.0.0.1").await.unwrap(), 0);
        assert!(!store.is_blocked("ip:10.0.0.1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_within_window() {
        let store = MemoryStore::new();

        assert_eq!(store.increment_count("k", WINDOW).await.unwrap(), 1);
        assert_eq!(store.increment_count("k", WINDOW).await.unwrap(), 2);
        assert_eq!(store.increment_count("k", WINDOW).await.unwrap(), 3);
        assert_eq!(store.get_count("k").await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_window_resets_to_one() {
        let store = MemoryStore::new();

        store.increment_count("k", WINDOW).await.unwrap();
        store.increment_count("k", WINDOW).await.unwrap();

        tokio::time::advance(Duration::from_millis(1001)).await;

        // The stale entry is still held but reads as absent.
        assert_eq!(store.counter_count(), 1);
        assert_eq!(store.get_count("k").await.unwrap(), 0);
        assert_eq!(store.increment_count("k", WINDOW).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_is_not_extended_by_increments() {
        let store = MemoryStore::new();

        store.increment_count("k", WINDOW).await.unwrap();
        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(store.increment_count("k", WINDOW).await.unwrap(), 2);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(store.increment_count("k", WINDOW).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_expires() {
        let store = MemoryStore::new();

        store.block("k", Duration::from_secs(2)).await.unwrap();
        assert!(store.is_blocked("k").await.unwrap());

        tokio::time::advance(Duration::from_millis(1999)).await;
        assert!(store.is_blocked("k").await.unwrap());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!store.is_blocked("k").await.unwrap());
        assert_eq!(store.block_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reblock_resets_expiry() {
        let store = MemoryStore::new();

        store.block("k", Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_millis(800)).await;
        store.block("k", Duration::from_secs(1)).await.unwrap();

        tokio::time::advance(Duration::from_millis(800)).await;
        assert!(store.is_blocked("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_swept() {
        let store = MemoryStore::new();

        for i in 0..1000 {
            let key = format!("ip:10.0.{}.{}", i / 256, i % 256);
            store.increment_count(&key, WINDOW).await.unwrap();
            store.block(&key, Duration::from_secs(1)).await.unwrap();
        }
        assert_eq!(store.counter_count(), 1000);
        assert_eq!(store.block_count(), 1000);

        tokio::time::advance(Duration::from_secs(3600)).await;
        store.increment_count("ip:192.0.2.1", WINDOW).await.unwrap();

        assert_eq!(store.counter_count(), 1);
        assert_eq!(store.block_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_live_entries() {
        let store = MemoryStore::new();

        store.increment_count("short", WINDOW).await.unwrap();
        store.increment_count("long", Duration::from_secs(600)).await.unwrap();
        store.block("blocked", Duration::from_secs(600)).await.unwrap();

        tokio::time::advance(SWEEP_INTERVAL).await;
        store.block("fresh", Duration::from_secs(1)).await.unwrap();

        assert_eq!(store.counter_count(), 1);
        assert_eq!(store.get_count("long").await.unwrap(), 1);
        assert!(store.is_blocked("blocked").await.unwrap());
        assert_eq!(store.block_count(), 2);
    }

    #[tokio::test]
    async fn test_zero_duration_block_is_not_blocked() {
        let store = MemoryStore::new();

        store.block("k", Duration::ZERO).await.unwrap();
        assert!(!store.is_blocked("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_counters_and_blocks_are_independent() {
        let store = MemoryStore::new();

        store.block("k", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get_count("k").await.unwrap(), 0);

        store.increment_count("other", WINDOW).await.unwrap();
        assert!(!store.is_blocked("other").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());
        let tasks = 64;

        let handles: Vec<_> = (0..tasks)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .increment_count("shared", Duration::from_secs(60))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut results = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect::<Vec<_>>();
        results.sort_unstable();

        assert_eq!(store.get_count("shared").await.unwrap(), tasks);
        assert_eq!(results, (1..=tasks).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_close_clears_state() {
        let store = MemoryStore::new();

        store.increment_count("k", WINDOW).await.unwrap();
        store.block("k", Duration::from_secs(60)).await.unwrap();
        store.close().await.unwrap();

        assert_eq!(store.counter_count(), 0);
        assert_eq!(store.block_count(), 0);
        assert!(!store.is_blocked("k").await.unwrap());
    }
}
