//! Log throttling utility
//!
//! A misbehaving peer can trigger the same warning for every datagram it
//! sends. The throttler lets one message per key through per interval.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Limits how often the same log message is recorded
///
/// Owned by the relay loop, so no interior locking is needed.
#[derive(Debug)]
pub struct LogThrottler {
    /// Key to the time it was last allowed through
    last_logged: HashMap<String, Instant>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: HashMap::new(),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` if a message for `key` should be logged now
    pub fn should_log(&mut self, key: &str) -> bool {
        self.should_log_at(key, Instant::now())
    }

    /// Same as [`should_log`](Self::should_log) with an explicit clock
    pub fn should_log_at(&mut self, key: &str, now: Instant) -> bool {
        match self.last_logged.get_mut(key) {
            Some(last) if now.saturating_duration_since(*last) < self.interval => false,
            Some(last) => {
                *last = now;
                true
            }
            None => {
                self.last_logged.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Forget a key, so its next message is logged immediately
    pub fn clear(&mut self, key: &str) {
        self.last_logged.remove(key);
    }

    /// Drop keys that have been quiet for a full interval
    pub fn prune(&mut self, now: Instant) {
        let interval = self.interval;
        self.last_logged
            .retain(|_, last| now.saturating_duration_since(*last) < interval);
    }

    pub fn len(&self) -> usize {
        self.last_logged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_logged.is_empty()
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `tracing::warn!`
///
/// ```ignore
/// warn_throttled!(throttler, "send_client", "Failed to send to client: {}", err);
/// ```
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_call_logs() {
        let mut throttler = LogThrottler::with_secs(1);
        assert!(throttler.should_log("recv"));
    }

    #[test]
    fn test_throttling_window() {
        let mut throttler = LogThrottler::new(Duration::from_millis(100));
        let start = Instant::now();

        assert!(throttler.should_log_at("recv", start));
        assert!(!throttler.should_log_at("recv", start + Duration::from_millis(50)));
        assert!(throttler.should_log_at("recv", start + Duration::from_millis(100)));
        // Window restarts from the last message that got through
        assert!(!throttler.should_log_at("recv", start + Duration::from_millis(150)));
    }

    #[test]
    fn test_keys_are_independent() {
        let mut throttler = LogThrottler::with_secs(10);
        assert!(throttler.should_log("refused:10.0.0.1:5000"));
        assert!(throttler.should_log("refused:10.0.0.2:5000"));
        assert!(!throttler.should_log("refused:10.0.0.1:5000"));
    }

    #[test]
    fn test_clear_and_prune() {
        let mut throttler = LogThrottler::with_secs(10);
        let start = Instant::now();

        assert!(throttler.should_log_at("a", start));
        assert!(throttler.should_log_at("b", start + Duration::from_secs(8)));
        throttler.clear("a");
        assert!(throttler.should_log_at("a", start + Duration::from_secs(1)));
        assert_eq!(throttler.len(), 2);

        throttler.prune(start + Duration::from_secs(12));
        assert_eq!(throttler.len(), 1);
        throttler.prune(start + Duration::from_secs(30));
        assert!(throttler.is_empty());
    }
}
