use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Rate guard for ERROR-level logging on hot failure paths.
///
/// Broker outages make every send and commit fail at once; callers check
/// `allow()` and keep the detail at debug level when it returns false.
pub struct LogThrottler {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl LogThrottler {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Whether an ERROR-level log may be emitted right now.
    pub fn allow(&self) -> bool {
        let mut last = self.last.lock().unwrap();
        match *last {
            Some(at) if at.elapsed() < self.min_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
