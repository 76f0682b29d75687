//! Redis-backed counter store.
//!
//! Increments run as a single Lua script so that the INCR and the EXPIRE on
//! a new key happen atomically: no key ever exists without a TTL, and two
//! instances incrementing the same key never lose an update.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, RedisResult, Script};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OnceCell};
use tracing::{debug, info, warn};

use super::CounterStore;
use crate::error::{QuotaGateError, Result};

/// INCR the key, and give it a TTL (ARGV[1] seconds) if this created it.
const INCREMENT_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
";

/// A counter store backed by Redis.
///
/// The connection is opened on first use and shared by all callers; it
/// multiplexes concurrent commands and reconnects after failures. A failed
/// connect is reported as a store outage and attempted again on the next
/// call, so the middleware can start while Redis is down.
pub struct RedisStore {
    client: Client,
    connect: Arc<ConnectState>,
    increment: Script,
    connect_timeout: Duration,
    retry_on_refused: bool,
}

/// Connection shared by all callers, and the attempt to open it.
///
/// An attempt runs on its own task, bounded only by the connect timeout.
/// Callers that give up waiting (a request hitting its store timeout) leave
/// it running, and at most one attempt is in flight at a time.
#[derive(Default)]
struct ConnectState {
    connection: OnceCell<ConnectionManager>,
    connecting: AtomicBool,
    /// Kind and message of the last failed attempt
    last_failure: Mutex<Option<(io::ErrorKind, String)>>,
    attempt_done: Notify,
}

impl ConnectState {
    /// Get the connection, waiting for an attempt built by `attempt` (or the
    /// one already in flight) when there is none yet.
    async fn connect_with<F, Fut>(self: &Arc<Self>, attempt: F) -> RedisResult<ConnectionManager>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = RedisResult<ConnectionManager>> + Send + 'static,
    {
        if let Some(connection) = self.connection.get() {
            return Ok(connection.clone());
        }

        // Registered before the attempt starts, so its end cannot be missed.
        let done = self.attempt_done.notified();
        self.spawn_attempt(attempt);
        if self.connecting.load(Ordering::Acquire) {
            done.await;
        }

        match self.connection.get() {
            Some(connection) => Ok(connection.clone()),
            None => Err(self.failure()),
        }
    }

    /// Start an attempt unless connected or one is already running.
    fn spawn_attempt<F, Fut>(self: &Arc<Self>, attempt: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RedisResult<ConnectionManager>> + Send + 'static,
    {
        if self.connection.initialized() || self.connecting.swap(true, Ordering::AcqRel) {
            return;
        }

        let state = self.clone();
        let attempt = attempt();
        tokio::spawn(async move {
            match attempt.await {
                Ok(connection) => {
                    let _ = state.connection.set(connection);
                    *state.last_failure.lock() = None;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to connect to Redis");
                    let kind = if e.is_connection_refusal() {
                        io::ErrorKind::ConnectionRefused
                    } else if e.is_timeout() {
                        io::ErrorKind::TimedOut
                    } else {
                        io::ErrorKind::Other
                    };
                    *state.last_failure.lock() = Some((kind, e.to_string()));
                }
            }
            state.connecting.store(false, Ordering::Release);
            state.attempt_done.notify_waiters();
        });
    }

    fn failure(&self) -> RedisError {
        let (kind, message) = match self.last_failure.lock().as_ref() {
            Some((kind, message)) => (*kind, message.clone()),
            None => (io::ErrorKind::NotConnected, "no connection to Redis".to_string()),
        };
        RedisError::from(io::Error::new(kind, message))
    }
}

impl RedisStore {
    /// Create a store for `url`. Does not connect.
    pub fn new(url: &str, connect_timeout: Duration, retry_on_refused: bool) -> Result<Self> {
        let client = Client::open(url).map_err(|e| {
            QuotaGateError::Config(format!("invalid Redis URL '{}': {}", url, e))
        })?;

        Ok(Self {
            client,
            connect: Arc::new(ConnectState::default()),
            increment: Script::new(INCREMENT_SCRIPT),
            connect_timeout,
            retry_on_refused,
        })
    }

    async fn connection(&self) -> RedisResult<ConnectionManager> {
        let client = self.client.clone();
        let connect_timeout = self.connect_timeout;

        self.connect
            .connect_with(move || async move {
                let addr = client.get_connection_info().addr.to_string();
                info!(addr = %addr, "Connecting to Redis");

                let connection = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
                    .await
                    .map_err(|_| {
                        RedisError::from(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "timed out connecting to Redis",
                        ))
                    })??;

                info!(addr = %addr, "Connected to Redis");
                Ok::<_, RedisError>(connection)
            })
            .await
    }

    async fn increment_once(&self, key: &str, ttl_secs: u64) -> RedisResult<u64> {
        let mut connection = self.connection().await?;
        let count: u64 = self
            .increment
            .key(key)
            .arg(ttl_secs)
            .invoke_async(&mut connection)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment_and_get(&self, key: &str, ttl: Duration) -> Result<u64> {
        let ttl_secs = ttl.as_secs().max(1);

        match self.increment_once(key, ttl_secs).await {
            Ok(count) => Ok(count),
            // A refused connection never delivered the command, so one retry
            // cannot double count.
            Err(e) if self.retry_on_refused && e.is_connection_refusal() => {
                let delay = Duration::from_millis(rand::thread_rng().gen_range(5..25));
                debug!(key = %key, delay_ms = delay.as_millis() as u64, "Redis refused connection, retrying once");
                tokio::time::sleep(delay).await;

                self.increment_once(key, ttl_secs).await.map_err(|e| {
                    warn!(key = %key, error = %e, "Redis increment failed after retry");
                    QuotaGateError::from(e)
                })
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Redis increment failed");
                Err(e.into())
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let mut connection = self.connection().await?;
        let value: Option<u64> = connection.get(key).await?;
        Ok(value)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
