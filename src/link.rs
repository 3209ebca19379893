//! Serial link health: counts consecutive read failures and decides when the
//! port should be cycled.

use std::time::{Duration, Instant};

/// reset policy for the device stream
///
/// a reset is due once `threshold` consecutive failures have piled up *and*
/// at least `cooldown` has passed since the last reset (or since startup).
#[derive(Debug, Clone)]
pub struct LinkHealth {
    threshold: u32,
    cooldown: Duration,
    failures: u32,
    last_reset: Instant,
}

impl LinkHealth {
    pub fn new(threshold: u32, cooldown: Duration, now: Instant) -> Self {
        Self {
            threshold,
            cooldown,
            failures: 0,
            last_reset: now,
        }
    }

    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn should_reset(&self, now: Instant) -> bool {
        self.failures > self.threshold && now.saturating_duration_since(self.last_reset) >= self.cooldown
    }

    /// a reset was attempted; start the next cooldown window
    ///
    /// the failure count is only cleared when the reset worked, so a dead
    /// port is retried once per window and not on every tick.
    pub fn mark_reset(&mut self, now: Instant, succeeded: bool) {
        self.last_reset = now;
        if succeeded {
            self.failures = 0;
        }
    }
}
