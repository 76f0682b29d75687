//! Counter key derivation.

use std::fmt;

/// Key identifying one counter in the store: a (rule, client, window) tuple
/// under a deployment-wide prefix.
///
/// Consecutive windows produce different keys, so counts reset by letting old
/// keys expire rather than by clearing them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// Namespace shared by every counter of this deployment
    pub prefix: String,
    /// Identity of the matched rule
    pub rule: String,
    /// Client the counter belongs to
    pub client: String,
    /// Index of the fixed window
    pub window: u64,
}

impl CounterKey {
    pub fn new(prefix: &str, rule: &str, client: &str, window: u64) -> Self {
        Self {
            prefix: prefix.to_string(),
            rule: rule.to_string(),
            client: client.to_string(),
            window,
        }
    }

    /// Render the key for the store.
    /// Format: "{prefix}:{rule}:{client}:{window}"
    /// `:` and `%` inside a segment are percent-escaped so that distinct
    /// tuples never render to the same key.
    pub fn to_store_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            escape_segment(&self.prefix),
            escape_segment(&self.rule),
            escape_segment(&self.client),
            self.window
        )
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_store_key())
    }
}

fn escape_segment(segment: &str) -> String {
    if !segment.contains([':', '%']) {
        return segment.to_string();
    }
    let mut escaped = String::with_capacity(segment.len() + 6);
    for c in segment.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_key() {
        let key = CounterKey::new("throttle", "GET =/hello", "10.0.0.1", 28401120);
        assert_eq!(key.to_store_key(), "throttle:GET =/hello:10.0.0.1:28401120");
        assert_eq!(key.to_string(), key.to_store_key());
    }

    #[test]
    fn test_same_tuple_same_key() {
        let a = CounterKey::new("throttle", "default", "c", 7);
        let b = CounterKey::new("throttle", "default", "c", 7);
        assert_eq!(a.to_store_key(), b.to_store_key());
    }

    #[test]
    fn test_windows_produce_distinct_keys() {
        let a = CounterKey::new("throttle", "default", "c", 7);
        let b = CounterKey::new("throttle", "default", "c", 8);
        assert_ne!(a.to_store_key(), b.to_store_key());
    }

    #[test]
    fn test_ipv6_clients_are_escaped() {
        let key = CounterKey::new("throttle", "default", "::1", 3);
        assert_eq!(key.to_store_key(), "throttle:default:%3A%3A1:3");
    }

    #[test]
    fn test_separator_in_segments_does_not_collide() {
        let a = CounterKey::new("throttle", "GET:x", "y", 1);
        let b = CounterKey::new("throttle", "GET", "x:y", 1);
        assert_ne!(a.to_store_key(), b.to_store_key());

        let c = CounterKey::new("throttle", "a%3Ab", "c", 1);
        let d = CounterKey::new("throttle", "a:b", "c", 1);
        assert_ne!(c.to_store_key(), d.to_store_key());
    }
}
