//! Per-cadence exponential backoff.
//!
//! Each cadence class keeps `{consecutive_failures, current_delay}`. A
//! success resets the delay to the base interval; each failure doubles it,
//! bounded by a cap:
//!
//! ```text
//! delay(f) = base                     if f == 0
//! delay(f) = min(base * 2^f, cap)     otherwise
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How the delay grows for one cadence class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Polling interval while the device answers.
    pub base: Duration,
    /// Upper bound for the delay after failures.
    pub cap: Duration,
    /// Maximum relative jitter applied to failure delays (0.0 disables).
    pub jitter: f64,
}

impl BackoffPolicy {
    /// Default cap as a multiple of the base interval.
    pub const DEFAULT_CAP_FACTOR: u32 = 10;

    /// Jitter used when enabled in configuration.
    pub const DEFAULT_JITTER: f64 = 0.15;

    /// Policy with the default cap and no jitter.
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            cap: base.saturating_mul(Self::DEFAULT_CAP_FACTOR),
            jitter: 0.0,
        }
    }

    #[must_use]
    pub fn cap(mut self, cap: Duration) -> Self {
        self.cap = cap.max(self.base);
        self
    }

    /// Set the cap as a multiple of the base interval.
    #[must_use]
    pub fn cap_factor(self, factor: u32) -> Self {
        let cap = self.base.saturating_mul(factor.max(1));
        self.cap(cap)
    }

    #[must_use]
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next attempt after `failures` consecutive failures,
    /// without jitter.
    #[must_use]
    pub fn delay_for_failures(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.base;
        }
        let factor = 2f64.powi(failures.min(63) as i32);
        let secs = (self.base.as_secs_f64() * factor).min(self.cap.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = (rand::rng().random::<f64>() * 2.0 - 1.0) * self.jitter;
        Duration::from_secs_f64((delay.as_secs_f64() * (1.0 + spread)).max(0.0))
    }
}

/// Retry state of one cadence class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffState {
    pub consecutive_failures: u32,
    pub current_delay: Duration,
}

impl BackoffState {
    /// Initial state: no failures, polling at the base interval.
    pub fn new(policy: &BackoffPolicy) -> Self {
        Self {
            consecutive_failures: 0,
            current_delay: policy.base,
        }
    }

    /// Reset after a successful poll and return the next delay.
    pub fn record_success(&mut self, policy: &BackoffPolicy) -> Duration {
        self.consecutive_failures = 0;
        self.current_delay = policy.base;
        self.current_delay
    }

    /// Register a failed poll and return the next delay.
    pub fn record_failure(&mut self, policy: &BackoffPolicy) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.current_delay = policy.apply_jitter(policy.delay_for_failures(self.consecutive_failures));
        self.current_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_delay_law_fast_defaults() {
        let policy = BackoffPolicy::new(Duration::from_secs(20));
        assert_eq!(policy.cap, Duration::from_secs(200));

        assert_eq!(policy.delay_for_failures(0), Duration::from_secs(20));
        assert_eq!(policy.delay_for_failures(1), Duration::from_secs(40));
        assert_eq!(policy.delay_for_failures(2), Duration::from_secs(80));
        assert_eq!(policy.delay_for_failures(3), Duration::from_secs(160));
        assert_eq!(policy.delay_for_failures(4), Duration::from_secs(200));
        assert_eq!(policy.delay_for_failures(u32::MAX), Duration::from_secs(200));
    }

    #[test]
    fn test_state_resets_on_success() {
        let policy = BackoffPolicy::new(Duration::from_secs(120));
        let mut state = BackoffState::new(&policy);

        assert_eq!(state.record_failure(&policy), Duration::from_secs(240));
        assert_eq!(state.record_failure(&policy), Duration::from_secs(480));
        assert_eq!(state.consecutive_failures, 2);

        assert_eq!(state.record_success(&policy), Duration::from_secs(120));
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn test_cap_never_below_base() {
        let policy = BackoffPolicy::new(Duration::from_secs(30)).cap(Duration::from_secs(5));
        assert_eq!(policy.cap, Duration::from_secs(30));
        assert_eq!(policy.delay_for_failures(3), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = BackoffPolicy::new(Duration::from_secs(20)).jitter(BackoffPolicy::DEFAULT_JITTER);
        let mut state = BackoffState::new(&policy);
        for _ in 0..50 {
            state.consecutive_failures = 0;
            let delay = state.record_failure(&policy).as_secs_f64();
            assert!((34.0..=46.0).contains(&delay), "delay {delay} out of range");
        }
    }

    proptest! {
        #[test]
        fn prop_delay_follows_law(base_secs in 5u64..3600, factor in 1u32..20, failures in 0u32..100) {
            let base = Duration::from_secs(base_secs);
            let policy = BackoffPolicy::new(base).cap_factor(factor);
            let delay = policy.delay_for_failures(failures);

            prop_assert!(delay >= base);
            prop_assert!(delay <= policy.cap);
            if failures > 0 && failures < 32 {
                let expected = (base_secs as f64 * 2f64.powi(failures as i32))
                    .min(policy.cap.as_secs_f64());
                prop_assert!((delay.as_secs_f64() - expected).abs() < 1e-6);
            }
        }

        #[test]
        fn prop_delay_monotonic(base_secs in 5u64..600, failures in 0u32..64) {
            let policy = BackoffPolicy::new(Duration::from_secs(base_secs));
            prop_assert!(policy.delay_for_failures(failures) <= policy.delay_for_failures(failures + 1));
        }
    }
}
