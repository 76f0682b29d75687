//! Fixed time windows and the clock they are measured against.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

/// Length of a fixed rate limit window, in whole seconds.
///
/// Time since the Unix epoch is cut into consecutive, non-overlapping windows
/// of this length. Window `n` covers `[n * len, (n + 1) * len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    secs: u64,
}

impl Window {
    pub const SECOND: Window = Window { secs: 1 };
    pub const MINUTE: Window = Window { secs: 60 };
    pub const HOUR: Window = Window { secs: 3600 };
    pub const DAY: Window = Window { secs: 86400 };

    /// Create a window of `secs` seconds. Returns `None` for zero.
    pub fn from_secs(secs: u64) -> Option<Self> {
        (secs > 0).then_some(Self { secs })
    }

    /// Window length in seconds. Also the TTL given to counters in the store.
    pub fn as_secs(&self) -> u64 {
        self.secs
    }

    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.secs)
    }

    /// Index of the window containing `now` (time since the Unix epoch).
    pub fn id_at(&self, now: Duration) -> u64 {
        now.as_secs() / self.secs
    }

    /// Time left until the window containing `now` ends.
    ///
    /// Never zero: at an exact boundary the next window has just begun and
    /// its full length remains.
    pub fn remaining_at(&self, now: Duration) -> Duration {
        let window_end = Duration::from_secs((self.id_at(now) + 1) * self.secs);
        window_end.saturating_sub(now)
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}s", self.secs)
    }
}

/// Source of the current time, as a duration since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        let millis = Utc::now().timestamp_millis().max(0) as u64;
        Duration::from_millis(millis)
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new(start: Duration) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, to: Duration) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_duration() {
        assert_eq!(Window::SECOND.duration(), Duration::from_secs(1));
        assert_eq!(Window::MINUTE.duration(), Duration::from_secs(60));
        assert_eq!(Window::HOUR.duration(), Duration::from_secs(3600));
        assert_eq!(Window::DAY.duration(), Duration::from_secs(86400));
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(Window::from_secs(0).is_none());
        assert_eq!(Window::from_secs(30).unwrap().as_secs(), 30);
    }

    #[test]
    fn test_window_id_floors_to_boundary() {
        let window = Window::MINUTE;
        assert_eq!(window.id_at(Duration::from_secs(0)), 0);
        assert_eq!(window.id_at(Duration::from_millis(59_999)), 0);
        assert_eq!(window.id_at(Duration::from_secs(60)), 1);
        assert_eq!(window.id_at(Duration::from_secs(1_704_067_230)), 28_401_120);
    }

    #[test]
    fn test_remaining_at() {
        let window = Window::MINUTE;
        assert_eq!(
            window.remaining_at(Duration::from_secs(120)),
            Duration::from_secs(60)
        );
        assert_eq!(
            window.remaining_at(Duration::from_millis(150_500)),
            Duration::from_millis(29_500)
        );
        assert_eq!(
            window.remaining_at(Duration::from_millis(179_999)),
            Duration::from_millis(1)
        );
    }

    #[test]
    fn test_manual_clock_is_shared_between_clones() {
        let clock = ManualClock::new(Duration::from_secs(10));
        let other = clock.clone();
        clock.advance(Duration::from_secs(5));
        assert_eq!(other.now(), Duration::from_secs(15));
        other.set(Duration::from_secs(1));
        assert_eq!(clock.now(), Duration::from_secs(1));
    }

    #[test]
    fn test_system_clock_is_after_2024() {
        assert!(SystemClock.now() > Duration::from_secs(1_704_067_200));
    }
}
