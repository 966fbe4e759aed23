//! Reconnect backoff: exponential growth with jitter, capped, reset on a successful connect.

use std::time::Duration;

use rand::Rng;

pub const DEFAULT_MIN_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(120);
const FACTOR: f64 = std::f64::consts::E;
const JITTER: f64 = 0.12;

#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
    fresh: bool,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
            fresh: true,
        }
    }

    /// Delay before the next attempt. The first call after a reset returns exactly `min`.
    pub fn next_delay(&mut self) -> Duration {
        if self.fresh {
            self.fresh = false;
            self.current = self.min;
            return self.min;
        }
        let grown = self.current.mul_f64(FACTOR).min(self.max);
        self.current = grown;
        let spread = rand::thread_rng().gen_range(-JITTER..=JITTER);
        grown.mul_f64(1.0 + spread).clamp(self.min, self.max)
    }

    pub fn reset(&mut self) {
        self.current = self.min;
        self.fresh = true;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_DELAY, DEFAULT_MAX_DELAY)
    }
}
