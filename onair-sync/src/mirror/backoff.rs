//! Retry delay computation
//!
//! Exponential backoff with symmetric jitter. The delay is only ever used to
//! schedule a retry; nothing sleeps a thread on it.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with symmetric jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry (attempt 1)
    pub base: Duration,
    /// Ceiling for the un-jittered delay
    pub max: Duration,
    /// Jitter as a fraction of the un-jittered delay
    pub jitter_ratio: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter_ratio: f64) -> Self {
        Self {
            base,
            max,
            jitter_ratio,
        }
    }

    /// Un-jittered delay: `min(max, base * 2^(attempt - 1))`
    ///
    /// `attempt` counts from 1; 0 is treated as 1.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1).saturating_sub(1).min(63) as i32;
        let scaled = self.base.as_secs_f64() * 2f64.powi(exponent);
        Duration::from_secs_f64(scaled.min(self.max.as_secs_f64()).max(0.0))
    }

    /// Jittered delay for `attempt`, drawing jitter from `rng`
    pub fn compute_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        compute_delay(attempt, self.base, self.max, self.jitter_ratio, rng)
    }
}

/// Jittered exponential delay
///
/// The un-jittered term `min(max, base * 2^(attempt-1))` is shifted by a value
/// drawn uniformly from `±(term * jitter_ratio)` and clamped at zero. Given the
/// same `rng` state the result is deterministic.
pub fn compute_delay<R: Rng + ?Sized>(
    attempt: u32,
    base: Duration,
    max: Duration,
    jitter_ratio: f64,
    rng: &mut R,
) -> Duration {
    let term = BackoffPolicy::new(base, max, jitter_ratio).base_delay(attempt);
    let term_secs = term.as_secs_f64();
    let spread = term_secs * jitter_ratio.max(0.0);

    let jittered = if spread > 0.0 {
        term_secs + rng.gen_range(-spread..=spread)
    } else {
        term_secs
    };

    Duration::from_secs_f64(jittered.max(0.0))
}
