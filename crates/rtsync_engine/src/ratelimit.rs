//! Rate limiting for repetitive log messages.

use std::time::{Duration, Instant};

/// Lets through at most `burst` messages per `interval`.
///
/// Suppressed messages are counted; the count is handed to the first
/// message let through afterwards so the log still says how much was
/// dropped.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    burst: u32,
    interval: Duration,
    window_start: Option<Instant>,
    used: u32,
    suppressed: u64,
}

impl RateLimiter {
    /// Creates a limiter.
    pub fn new(burst: u32, interval: Duration) -> Self {
        Self {
            burst: burst.max(1),
            interval,
            window_start: None,
            used: 0,
            suppressed: 0,
        }
    }

    /// Returns `Some(suppressed)` if a message may be logged at `now`,
    /// where `suppressed` is the number of messages dropped since the last
    /// one that was let through.
    pub fn check(&mut self, now: Instant) -> Option<u64> {
        let expired = self
            .window_start
            .map_or(true, |start| now.saturating_duration_since(start) >= self.interval);
        if expired {
            self.window_start = Some(now);
            self.used = 0;
        }
        if self.used < self.burst {
            self.used += 1;
            Some(std::mem::take(&mut self.suppressed))
        } else {
            self.suppressed += 1;
            None
        }
    }

    /// Messages dropped since the last one let through.
    #[must_use]
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_suppress() {
        let mut rl = RateLimiter::new(2, Duration::from_secs(60));
        let t0 = Instant::now();
        assert_eq!(rl.check(t0), Some(0));
        assert_eq!(rl.check(t0), Some(0));
        assert_eq!(rl.check(t0), None);
        assert_eq!(rl.check(t0 + Duration::from_secs(1)), None);
        assert_eq!(rl.suppressed(), 2);

        assert_eq!(rl.check(t0 + Duration::from_secs(61)), Some(2));
        assert_eq!(rl.suppressed(), 0);
    }

    #[test]
    fn zero_burst_still_logs_once() {
        let mut rl = RateLimiter::new(0, Duration::from_secs(1));
        let t0 = Instant::now();
        assert!(rl.check(t0).is_some());
        assert!(rl.check(t0).is_none());
    }
}
