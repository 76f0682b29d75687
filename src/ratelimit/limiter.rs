//! The rate limit decision engine.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::backend::DecisionBackend;
use super::decision::Decision;
use super::descriptor::{RequestDescriptor, ANONYMOUS_CLIENT};
use super::key::CounterKey;
use super::rules::{Rule, RuleSet};
use super::window::{Clock, SystemClock};
use crate::config::{FailPolicy, LimiterSettings};
use crate::error::{QuotaGateError, Result};
use crate::store::{self, CounterStore};

/// Default namespace of counter keys.
pub const DEFAULT_KEY_PREFIX: &str = "throttle";
/// Default budget for one store round trip.
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(100);

/// Decides whether requests may proceed, using fixed-window counters in a
/// shared store.
///
/// Each request increments exactly one counter, keyed by the first matching
/// rule, the client and the current window. Counting in fixed windows lets a
/// client send up to twice a rule's limit across a window boundary; use
/// shorter windows where that matters.
///
/// The engine holds no mutable state of its own and is shared between tasks
/// behind an `Arc`.
pub struct LimiterEngine {
    /// Rules, read-only after construction
    rules: Arc<RuleSet>,
    /// Shared counters
    store: Arc<dyn CounterStore>,
    key_prefix: String,
    fail_policy: FailPolicy,
    store_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl LimiterEngine {
    /// Create an engine with the default key prefix, fail-open policy and
    /// store timeout.
    pub fn new(rules: RuleSet, store: Arc<dyn CounterStore>) -> Self {
        Self {
            rules: Arc::new(rules),
            store,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            fail_policy: FailPolicy::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            clock: Arc::new(SystemClock),
        }
    }

    /// Build an engine from settings, opening the configured store.
    ///
    /// Any error here is a configuration error and should stop startup.
    pub fn configure(settings: &LimiterSettings) -> Result<Self> {
        Self::configure_with_clock(settings, Arc::new(SystemClock))
    }

    /// Like [`LimiterEngine::configure`], measuring windows against `clock`.
    pub fn configure_with_clock(settings: &LimiterSettings, clock: Arc<dyn Clock>) -> Result<Self> {
        if settings.key_prefix.trim().is_empty() {
            return Err(QuotaGateError::Config("key_prefix must not be empty".to_string()));
        }
        if settings.store.timeout_ms == 0 {
            return Err(QuotaGateError::Config(
                "store.timeout_ms must be at least 1".to_string(),
            ));
        }

        let default_window = settings.default_window.to_window()?;
        let rules = RuleSet::from_config(&settings.rules, settings.default_limit, default_window)?;
        let store = store::open(&settings.store, clock.clone())?;

        info!(
            rules = rules.len(),
            default_limit = settings.default_limit,
            default_window = %default_window,
            key_prefix = %settings.key_prefix,
            fail_policy = ?settings.fail_policy,
            store = store.name(),
            "Rate limiter configured"
        );

        Ok(Self::new(rules, store)
            .with_key_prefix(&settings.key_prefix)
            .with_fail_policy(settings.fail_policy)
            .with_store_timeout(Duration::from_millis(settings.store.timeout_ms))
            .with_clock(clock))
    }

    /// Namespace counter keys under `key_prefix`.
    pub fn with_key_prefix(mut self, key_prefix: &str) -> Self {
        self.key_prefix = key_prefix.to_string();
        self
    }

    /// Set how decisions are made while the store is unavailable.
    pub fn with_fail_policy(mut self, fail_policy: FailPolicy) -> Self {
        self.fail_policy = fail_policy;
        self
    }

    /// Bound each store round trip to `store_timeout`.
    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    /// Measure windows against `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The rules this engine decides with.
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// The policy applied when the store is unavailable.
    pub fn fail_policy(&self) -> FailPolicy {
        self.fail_policy
    }

    /// The namespace of this engine's counter keys.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Count the request and decide whether it may proceed.
    ///
    /// Never fails: a store outage or timeout is resolved by the fail policy
    /// into a decision flagged `degraded`. Dropping the returned future drops
    /// the pending store call with it.
    pub async fn decide(&self, descriptor: &RequestDescriptor) -> Decision {
        if let Err(e) = descriptor.validate() {
            debug!(error = %e, "Deciding on incomplete request descriptor");
        }
        let descriptor = descriptor.normalized();

        let rule = self.rules.resolve(&descriptor.method, &descriptor.path);
        let now = self.clock.now();
        let key = self.counter_key(rule, &descriptor, now);
        let retry_after = rule.window().remaining_at(now);

        trace!(
            key = %key,
            rule = %rule.id(),
            limit = rule.limit(),
            "Checking rate limit"
        );

        match self.increment(&key, rule).await {
            Ok(count) => {
                let decision = Decision::counted(rule.id(), count, rule.limit(), retry_after);
                if !decision.allowed {
                    debug!(
                        key = %key,
                        count = count,
                        limit = rule.limit(),
                        "Rate limit exceeded"
                    );
                }
                decision
            }
            Err(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    fail_policy = ?self.fail_policy,
                    "Counter store unavailable, applying fail policy"
                );
                Decision::degraded(rule.id(), self.fail_policy.allows(), rule.limit(), retry_after)
            }
        }
    }

    /// Decide on a request given as its raw parts.
    pub async fn decide_request(
        &self,
        method: &str,
        path: &str,
        client_identity: Option<&str>,
    ) -> Decision {
        self.decide(&RequestDescriptor::new(method, path, client_identity))
            .await
    }

    /// Get the current window's count for a request without counting it.
    pub async fn counter_value(&self, descriptor: &RequestDescriptor) -> Result<Option<u64>> {
        let descriptor = descriptor.normalized();
        let rule = self.rules.resolve(&descriptor.method, &descriptor.path);
        let key = self.counter_key(rule, &descriptor, self.clock.now()).to_store_key();
        let value = self.store.get(&key).await?;
        Ok(value)
    }

    fn counter_key(&self, rule: &Rule, descriptor: &RequestDescriptor, now: Duration) -> CounterKey {
        CounterKey::new(
            &self.key_prefix,
            rule.id(),
            descriptor.client().unwrap_or(ANONYMOUS_CLIENT),
            rule.window().id_at(now),
        )
    }

    async fn increment(&self, key: &CounterKey, rule: &Rule) -> Result<u64> {
        let store_key = key.to_store_key();
        let increment = self
            .store
            .increment_and_get(&store_key, rule.window().duration());

        match tokio::time::timeout(self.store_timeout, increment).await {
            Ok(result) => result,
            Err(_) => Err(QuotaGateError::StoreUnavailable(format!(
                "no answer from {} store within {:?}",
                self.store.name(),
                self.store_timeout
            ))),
        }
    }
}

#[async_trait]
impl DecisionBackend for LimiterEngine {
    async fn decide(&self, descriptor: &RequestDescriptor) -> Decision {
        self.decide(descriptor).await
    }
}
