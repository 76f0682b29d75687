//! The outcome of a rate limit check.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Header carrying the limit of the rule that governed the request.
pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
/// Header carrying the requests left in the current window.
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
/// Header set when the decision was made without the counter store.
pub const HEADER_DEGRADED: &str = "x-ratelimit-degraded";
/// Standard header telling a rejected client how long to back off.
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Whether a request may proceed, and the quota state behind that answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Post-increment count of the window; zero for degraded decisions
    pub current_count: u64,
    pub limit: u64,
    pub remaining: u64,
    /// Time until the current window ends
    pub retry_after: Duration,
    /// The store did not confirm the count; the fail policy decided
    pub degraded: bool,
    /// Identity of the rule that governed the request
    pub rule: String,
}

impl Decision {
    /// A decision backed by a count the store returned.
    pub fn counted(rule: &str, count: u64, limit: u64, retry_after: Duration) -> Self {
        Self {
            allowed: count <= limit,
            current_count: count,
            limit,
            remaining: limit.saturating_sub(count),
            retry_after,
            degraded: false,
            rule: rule.to_string(),
        }
    }

    /// A decision made by the fail policy because the store was unavailable.
    pub fn degraded(rule: &str, allowed: bool, limit: u64, retry_after: Duration) -> Self {
        Self {
            allowed,
            current_count: 0,
            limit,
            remaining: if allowed { limit } else { 0 },
            retry_after,
            degraded: true,
            rule: rule.to_string(),
        }
    }

    /// `retry_after` rounded up to whole seconds.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }

    pub fn payload(&self) -> DecisionPayload {
        DecisionPayload {
            allowed: self.allowed,
            limit: self.limit,
            remaining: self.remaining,
            retry_after_seconds: self.retry_after_secs(),
            degraded: self.degraded,
        }
    }

    /// Headers to surface on the response, as (name, value) pairs.
    ///
    /// `Retry-After` is only included for rejected requests.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
        ];
        if !self.allowed {
            headers.push((HEADER_RETRY_AFTER, self.retry_after_secs().to_string()));
        }
        if self.degraded {
            headers.push((HEADER_DEGRADED, "true".to_string()));
        }
        headers
    }
}

/// The decision as handed to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionPayload {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub retry_after_seconds: u64,
    pub degraded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counted_within_limit() {
        let decision = Decision::counted("GET *", 5, 5, Duration::from_millis(400));
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(!decision.degraded);
        assert_eq!(decision.retry_after_secs(), 1);
    }

    #[test]
    fn test_counted_over_limit() {
        let decision = Decision::counted("GET *", 6, 5, Duration::from_secs(12));
        assert!(!decision.allowed);
        assert_eq!(decision.current_count, 6);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after_secs(), 12);
    }

    #[test]
    fn test_degraded_remaining_follows_policy() {
        let open = Decision::degraded("default", true, 10, Duration::from_secs(1));
        assert!(open.allowed && open.degraded);
        assert_eq!(open.remaining, 10);

        let closed = Decision::degraded("default", false, 10, Duration::from_secs(1));
        assert!(!closed.allowed && closed.degraded);
        assert_eq!(closed.remaining, 0);
    }

    #[test]
    fn test_payload_serialization() {
        let decision = Decision::counted("POST *", 2, 5, Duration::from_millis(2500));
        let json = serde_json::to_value(decision.payload()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "allowed": true,
                "limit": 5,
                "remaining": 3,
                "retry_after_seconds": 3,
                "degraded": false
            })
        );
    }

    #[test]
    fn test_headers() {
        let allowed = Decision::counted("default", 1, 10, Duration::from_secs(1));
        assert_eq!(
            allowed.headers(),
            vec![
                (HEADER_LIMIT, "10".to_string()),
                (HEADER_REMAINING, "9".to_string()),
            ]
        );

        let denied = Decision::degraded("default", false, 10, Duration::from_secs(30));
        let headers = denied.headers();
        assert!(headers.contains(&(HEADER_RETRY_AFTER, "30".to_string())));
        assert!(headers.contains(&(HEADER_DEGRADED, "true".to_string())));
    }
}
