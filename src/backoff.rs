// ABOUTME: Exponential backoff policy shared by rollout polling and health verification.
// ABOUTME: Delays grow by a multiplier from an initial value and are clamped to a cap.

use serde::Deserialize;
use std::time::Duration;

/// Backoff schedule for polling loops.
///
/// The delay before poll `n + 1` is `initial * multiplier^n`, clamped to `cap`.
/// `max_attempts` bounds the number of polls; `None` leaves the loop bounded only by
/// the caller's timeout.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct BackoffPolicy {
    #[serde(with = "humantime_serde")]
    pub initial: Duration,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(with = "humantime_serde")]
    pub cap: Duration,

    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_multiplier() -> f64 {
    2.0
}

impl BackoffPolicy {
    pub fn new(initial: Duration, multiplier: f64, cap: Duration) -> Self {
        Self {
            initial,
            multiplier,
            cap,
            max_attempts: None,
        }
    }

    /// Fixed interval between attempts.
    pub fn constant(interval: Duration) -> Self {
        Self::new(interval, 1.0, interval)
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Rollout polling default: start at 2s, double, cap at 30s.
    pub fn rollout_default() -> Self {
        Self::new(Duration::from_secs(2), 2.0, Duration::from_secs(30))
    }

    /// Delay to wait after the given zero-based attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let cap = self.cap.max(self.initial);
        let multiplier = if self.multiplier.is_finite() && self.multiplier >= 1.0 {
            self.multiplier
        } else {
            1.0
        };

        let factor = multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.initial.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= cap.as_secs_f64() {
            return cap;
        }
        Duration::from_secs_f64(secs)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn allows(&self, attempts_made: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts_made < max)
    }

    /// Iterator over successive delays, finite when `max_attempts` is set.
    pub fn delays(&self) -> Delays {
        Delays {
            policy: *self,
            attempt: 0,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::rollout_default()
    }
}

/// Iterator returned by [`BackoffPolicy::delays`].
#[derive(Debug, Clone)]
pub struct Delays {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if !self.policy.allows(self.attempt) {
            return None;
        }
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }
}
