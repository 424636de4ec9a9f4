//! Log throttling utility
//!
//! Limits how often the same log message is recorded, so that a session whose
//! transport keeps failing a statistics poll every 300 ms does not flood the log.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Log throttler keyed by message kind
///
/// # Example
///
/// ```rust
/// use duet::utils::LogThrottler;
/// use std::time::Duration;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert!(throttler.should_log("stats:alice"));
/// assert!(!throttler.should_log("stats:alice"));
/// ```
pub struct LogThrottler {
    last_logged: RwLock<HashMap<String, Instant>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: RwLock::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` if the message should be logged now.
    ///
    /// A `true` result records the current instant for `key`.
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();

        if let Some(last) = self.last_logged.read().get(key) {
            if now.duration_since(*last) < self.interval {
                return false;
            }
        }

        let mut map = self.last_logged.write();
        if let Some(last) = map.get(key) {
            if now.duration_since(*last) < self.interval {
                return false;
            }
        }
        map.insert(key.to_string(), now);
        true
    }

    /// Forget `key`, so the next failure after a recovery is logged immediately.
    pub fn clear(&self, key: &str) {
        self.last_logged.write().remove(key);
    }

    pub fn len(&self) -> usize {
        self.last_logged.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_logged.read().is_empty()
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `warn!`
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
    use std::thread;

    #[test]
    fn test_throttling() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert!(throttler.should_log("stats"));
        assert!(!throttler.should_log("stats"));

        thread::sleep(Duration::from_millis(150));
        assert!(throttler.should_log("stats"));
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("alice"));
        assert!(throttler.should_log("bob"));
        assert!(!throttler.should_log("alice"));
        assert_eq!(throttler.len(), 2);
    }

    #[test]
    fn test_clear_after_recovery() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("alice"));
        throttler.clear("alice");
        assert!(throttler.should_log("alice"));
    }
}
