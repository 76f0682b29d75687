//! Shared counter storage.
//!
//! Counters live in an external key-value store so that every instance of
//! the middleware sees the same counts. This module defines the contract the
//! limiter relies on and its implementations:
//!
//! - **Redis**: the shared store for multi-instance deployments
//! - **Memory**: process-local counters for single instances and tests

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::StoreSettings;
use crate::error::{QuotaGateError, Result};
use crate::ratelimit::Clock;

/// Trait for counter store implementations.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add one to the counter at `key` and return the new value.
    ///
    /// A missing key is created with value 1 and expires after `ttl`; the
    /// expiry is set in the same atomic step as the creation. Concurrent
    /// callers on one key each observe a distinct value.
    async fn increment_and_get(&self, key: &str, ttl: Duration) -> Result<u64>;

    /// Read a counter without changing it. Diagnostics only.
    async fn get(&self, key: &str) -> Result<Option<u64>>;

    /// Store type name for logs.
    fn name(&self) -> &'static str;
}

/// Open the store named by `settings.url`.
///
/// `memory://` selects the process-local store; `redis://`, `rediss://` and
/// `redis+unix://` select Redis.
pub fn open(settings: &StoreSettings, clock: Arc<dyn Clock>) -> Result<Arc<dyn CounterStore>> {
    let url = settings.url.trim();

    if url.starts_with("memory://") {
        info!("Using in-process counter store");
        return Ok(Arc::new(MemoryStore::with_clock(clock)));
    }

    if ["redis://", "rediss://", "redis+unix://"]
        .iter()
        .any(|scheme| url.starts_with(scheme))
    {
        let store = RedisStore::new(
            url,
            Duration::from_millis(settings.connect_timeout_ms),
            settings.retry_on_refused,
        )?;
        return Ok(Arc::new(store));
    }

    Err(QuotaGateError::Config(format!(
        "unsupported counter store URL '{}'",
        url
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::SystemClock;

    fn settings(url: &str) -> StoreSettings {
        StoreSettings {
            url: url.to_string(),
            ..StoreSettings::default()
        }
    }

    #[test]
    fn test_open_memory_store() {
        let store = open(&settings("memory://"), Arc::new(SystemClock)).unwrap();
        assert_eq!(store.name(), "memory");
    }

    #[test]
    fn test_open_redis_store_is_lazy() {
        // Nothing listens here; opening must still succeed.
        let store = open(&settings("redis://127.0.0.1:1/"), Arc::new(SystemClock)).unwrap();
        assert_eq!(store.name(), "redis");
    }

    #[test]
    fn test_open_unknown_scheme() {
        let err = open(&settings("memcached://localhost"), Arc::new(SystemClock))
            .err()
            .unwrap();
        assert!(matches!(err, QuotaGateError::Config(_)));
    }
}
