//! Transfer-rate pacing for one worker.
//!
//! The limiter tracks the byte debt accumulated by chunk reads and sleeps
//! just long enough to keep the observed rate at the per-process share.
//! Short bursts are coalesced: it never sleeps for less than 100 ms, so a
//! stream of small chunks does not degenerate into a context-switch storm.

use std::time::{Duration, Instant};

/// Below this the limiter accumulates debt instead of sleeping.
const MIN_SLEEP: Duration = Duration::from_millis(100);

/// Rebase interval: old debt is retired so the counters stay small and a
/// long stall does not turn into a burst allowance.
const REBASE_AFTER: Duration = Duration::from_secs(4);

pub struct RateLimiter {
    /// Bytes per second; zero disables pacing.
    limit: u64,
    debt: u64,
    started: Instant,
    #[cfg(test)]
    recorded: Vec<Duration>,
}

impl RateLimiter {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            debt: 0,
            started: Instant::now(),
            #[cfg(test)]
            recorded: Vec::new(),
        }
    }

    /// Re-arm for a new file with a fresh per-process share (the share
    /// changes whenever a sibling worker connects or disconnects).
    pub fn reset(&mut self, limit: u64) {
        self.limit = limit;
        self.debt = 0;
        self.started = Instant::now();
    }

    pub fn is_active(&self) -> bool {
        self.limit > 0
    }

    /// Account `n` streamed bytes and pace when we are ahead of the limit.
    pub fn register(&mut self, n: u64) {
        if self.limit == 0 {
            return;
        }
        self.debt = self.debt.saturating_add(n);
        let elapsed = self.started.elapsed();
        let target = Duration::from_secs_f64(self.debt as f64 / self.limit as f64);
        if target > elapsed {
            let wait = target - elapsed;
            if wait >= MIN_SLEEP {
                self.sleep(wait);
            }
        }
        if elapsed >= REBASE_AFTER {
            let paid = (elapsed.as_secs_f64() * self.limit as f64) as u64;
            self.debt = self.debt.saturating_sub(paid);
            self.started = Instant::now();
        }
    }

    #[cfg(not(test))]
    fn sleep(&mut self, d: Duration) {
        std::thread::sleep(d);
    }

    // tests observe the requested sleeps instead of paying them
    #[cfg(test)]
    fn sleep(&mut self, d: Duration) {
        self.recorded.push(d);
    }
}
