//! Retry cadence for cycles that could not reach the central store.
//!
//! `BackoffPolicy` holds the pure delay computation; `Backoff` is the
//! dispatcher-private state (consecutive failures, current delay).

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the nominal delay that jitter may shave off, in `[0, 1)`.
    pub jitter: f64,
}

impl BackoffPolicy {
    /// Delay before jitter after `failures` consecutive failures:
    /// `base * 2^(failures - 1)`, capped at `max`. Zero failures means no wait.
    #[must_use]
    pub fn nominal_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    /// Jittered delay for the `failures`-th consecutive failure.
    ///
    /// `unit` is a uniform sample in `[0, 1]`. The result never drops below
    /// `previous` and never exceeds `max`, so a run of failures yields a
    /// non-decreasing, capped sequence however the jitter falls.
    #[must_use]
    pub fn next_delay(&self, failures: u32, previous: Duration, unit: f64) -> Duration {
        let nominal = self.nominal_delay(failures);
        let scale = 1.0 - self.jitter.clamp(0.0, 1.0) * unit.clamp(0.0, 1.0);
        nominal.mul_f64(scale).max(previous).min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
    delay: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            delay: Duration::ZERO,
        }
    }

    /// Register a connectivity failure and return how long to wait.
    pub fn record_failure(&mut self) -> Duration {
        self.record_failure_with(fastrand::f64())
    }

    /// `record_failure` with an explicit jitter sample.
    pub fn record_failure_with(&mut self, unit: f64) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.delay = self.policy.next_delay(self.failures, self.delay, unit);
        self.delay
    }

    /// Back to baseline after a cycle that made progress.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.delay = Duration::ZERO;
    }

    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    #[must_use]
    pub fn current_delay(&self) -> Duration {
        self.delay
    }

    #[must_use]
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}
