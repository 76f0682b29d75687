//! Process-local counter store.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::CounterStore;
use crate::error::Result;
use crate::ratelimit::{Clock, SystemClock};

/// Minimum clock time between two sweeps of expired counters.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct Slot {
    count: u64,
    /// Clock time at which the counter expires
    expires_at: Duration,
}

/// Counters held in process memory, with the same expiry semantics as the
/// shared store.
///
/// Each increment runs under the map's per-shard lock, so concurrent
/// increments of one key never lose updates. Counts are not shared with other
/// processes.
///
/// Every window brings new keys, so increments also sweep out expired
/// counters, at most once per [`SWEEP_INTERVAL`] of clock time.
pub struct MemoryStore {
    counters: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
    /// Clock time at which the next sweep is due
    next_sweep: Mutex<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store whose expiry is measured against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
            next_sweep: Mutex::new(Duration::ZERO),
        }
    }

    /// Drop expired counters. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(self.clock.now())
    }

    fn purge_expired_at(&self, now: Duration) -> usize {
        let before = self.counters.len();
        self.counters.retain(|_, slot| slot.expires_at > now);
        let removed = before.saturating_sub(self.counters.len());
        if removed > 0 {
            trace!(removed, remaining = self.counters.len(), "Purged expired counters");
        }
        removed
    }

    fn sweep_if_due(&self, now: Duration) {
        {
            let mut next_sweep = self.next_sweep.lock();
            if now < *next_sweep {
                return;
            }
            *next_sweep = now + SWEEP_INTERVAL;
        }
        self.purge_expired_at(now);
    }

    /// Number of counters held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment_and_get(&self, key: &str, ttl: Duration) -> Result<u64> {
        let now = self.clock.now();
        // Must run before the entry below is locked.
        self.sweep_if_due(now);

        let fresh = Slot {
            count: 0,
            expires_at: now + ttl,
        };

        let mut slot = self.counters.entry(key.to_string()).or_insert(fresh);
        if slot.expires_at <= now {
            *slot = fresh;
        }
        slot.count += 1;
        Ok(slot.count)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let now = self.clock.now();
        Ok(self
            .counters
            .get(key)
            .filter(|slot| slot.expires_at > now)
            .map(|slot| slot.count))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;

    const TTL: Duration = Duration::from_secs(10);

    fn store() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::new(Duration::from_secs(1000));
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_increment_creates_and_counts() {
        let (store, _clock) = store();

        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.increment_and_get("k", TTL).await.unwrap(), 1);
        assert_eq!(store.increment_and_get("k", TTL).await.unwrap(), 2);
        assert_eq!(store.get("k").await.unwrap(), Some(2));
        assert_eq!(store.increment_and_get("other", TTL).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_counter_expires_after_ttl() {
        let (store, clock) = store();

        store.increment_and_get("k", TTL).await.unwrap();
        store.increment_and_get("k", TTL).await.unwrap();

        clock.advance(Duration::from_secs(9));
        assert_eq!(store.get("k").await.unwrap(), Some(2));

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.increment_and_get("k", TTL).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_increment_does_not_extend_ttl() {
        let (store, clock) = store();

        store.increment_and_get("k", TTL).await.unwrap();
        clock.advance(Duration::from_secs(8));
        store.increment_and_get("k", TTL).await.unwrap();
        clock.advance(Duration::from_secs(2));

        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store();

        store.increment_and_get("short", Duration::from_secs(1)).await.unwrap();
        store.increment_and_get("long", TTL).await.unwrap();
        clock.advance(Duration::from_secs(5));

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("long").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_increments_sweep_counters_of_past_windows() {
        let (store, clock) = store();

        for window in 0..1000 {
            let key = format!("rule:client:{}", window);
            assert_eq!(store.increment_and_get(&key, Duration::from_secs(1)).await.unwrap(), 1);
            assert!(store.len() <= 2, "{} counters held at window {}", store.len(), window);
            clock.advance(Duration::from_secs(1));
        }
    }

    #[tokio::test]
    async fn test_sweep_keeps_live_counters() {
        let (store, clock) = store();

        store.increment_and_get("long", TTL).await.unwrap();
        for _ in 0..5 {
            clock.advance(Duration::from_secs(1));
            store.increment_and_get("short", Duration::from_secs(1)).await.unwrap();
        }

        assert_eq!(store.get("long").await.unwrap(), Some(1));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment_and_get("k", TTL).await.unwrap() })
            })
            .collect();

        let mut counts: Vec<u64> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        counts.sort_unstable();

        assert_eq!(counts, (1..=200).collect::<Vec<u64>>());
    }
}
