//! Retry backoff
//!
//! Exponential backoff with jitter for transient apply and connection
//! failures. Base 100ms doubling to a 30s cap, each delay jittered ±20% so
//! two streams retrying against the same endpoint do not pulse in step.

use rand::Rng;
use std::time::Duration;

/// Default backoff base.
pub const BACKOFF_BASE: Duration = Duration::from_millis(100);
/// Default backoff cap.
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);
const JITTER_RATIO: f64 = 0.2;

/// Exponential backoff with jitter.
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// The relay's standard policy.
    pub fn standard() -> Self {
        Self::new(BACKOFF_BASE, BACKOFF_CAP)
    }

    /// Next delay, jittered. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.cap);
        self.attempt += 1;

        let jitter = rand::thread_rng().gen_range(-JITTER_RATIO..=JITTER_RATIO);
        let jittered = exp.as_secs_f64() * (1.0 + jitter);
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Forget accumulated failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts taken since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::standard()
    }
}
