//! Exponential backoff with jitter.
//!
//! `delay = min(max_delay, base * 2^min(attempt, 10) * (1 + jitter * r))` with
//! `r` drawn uniformly from `[0, 1)`. Used by the reconnect loop and anything
//! else that retries on its own schedule.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponent growth stops here so `2^attempt` cannot overflow.
pub const MAX_EXPONENT: u32 = 10;

/// Smallest delay ever returned.
const MIN_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    base: Duration,
    max_delay: Duration,
    /// Jitter factor in `[0.0, 1.0]`.
    jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 0.3)
    }
}

impl Backoff {
    /// Build a calculator. `jitter` is clamped into `[0, 1]`; values above 1
    /// would let a jittered delay overtake the next attempt's minimum.
    pub fn new(base: Duration, max_delay: Duration, jitter: f64) -> Self {
        let base = base.max(MIN_DELAY);
        Self {
            base,
            max_delay: max_delay.max(base),
            jitter: if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 },
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_sample(attempt, rand::random::<f64>())
    }

    /// Deterministic variant of [`Backoff::delay`] for a given random draw.
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let sample = if sample.is_finite() { sample.clamp(0.0, 1.0) } else { 0.0 };
        let exponent = attempt.min(MAX_EXPONENT) as i32;

        let base_ns = self.base.as_nanos() as f64;
        let max_ns = self.max_delay.as_nanos() as f64;
        let raw_ns = base_ns * 2f64.powi(exponent) * (1.0 + self.jitter * sample);

        let ns = raw_ns.min(max_ns).max(MIN_DELAY.as_nanos() as f64);
        Duration::from_nanos(ns.round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn doubles_until_capped() {
        let b = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 0.0);
        assert_eq!(b.delay_with_sample(0, 0.5), Duration::from_millis(100));
        assert_eq!(b.delay_with_sample(1, 0.5), Duration::from_millis(200));
        assert_eq!(b.delay_with_sample(3, 0.5), Duration::from_millis(800));
        assert_eq!(b.delay_with_sample(4, 0.5), Duration::from_secs(1));
        assert_eq!(b.delay_with_sample(u32::MAX, 0.5), Duration::from_secs(1));
    }

    #[test]
    fn jitter_only_stretches_the_delay() {
        let b = Backoff::new(Duration::from_millis(100), Duration::from_secs(60), 0.5);
        assert_eq!(b.delay_with_sample(0, 0.0), Duration::from_millis(100));
        assert_eq!(b.delay_with_sample(0, 1.0), Duration::from_millis(150));
    }

    #[test]
    fn degenerate_inputs_are_sanitised() {
        let b = Backoff::new(Duration::ZERO, Duration::ZERO, f64::NAN);
        assert!(b.delay(0) > Duration::ZERO);
        assert_eq!(b.jitter(), 0.0);

        let b = Backoff::new(Duration::from_millis(10), Duration::from_secs(1), 7.0);
        assert_eq!(b.jitter(), 1.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: delays never shrink as attempts grow, whatever the draws.
        #[test]
        fn delays_are_monotonic_across_attempts(
            base_ms in 1u64..5_000,
            max_ms in 1u64..600_000,
            jitter in 0.0f64..=1.0,
            a in 0u32..=MAX_EXPONENT,
            step in 1u32..5,
            sa in 0.0f64..1.0,
            sb in 0.0f64..1.0,
        ) {
            let b = Backoff::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms), jitter);
            let earlier = b.delay_with_sample(a, sa);
            let later = b.delay_with_sample((a + step).min(MAX_EXPONENT), sb);
            prop_assert!(earlier <= later || (a + step) > MAX_EXPONENT);
        }

        /// Property: every delay is positive and within the cap.
        #[test]
        fn delays_are_positive_and_capped(
            base_ms in 0u64..5_000,
            max_ms in 0u64..600_000,
            attempt in any::<u32>(),
        ) {
            let b = Backoff::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms), 0.3);
            let d = b.delay(attempt);
            prop_assert!(d > Duration::ZERO);
            prop_assert!(d <= b.max_delay());
        }
    }
}
