//! Retry Backoff
//!
//! Per-item exponential backoff for failed reconciliations:
//! `base * 2^failures`, capped at `max`, plus up to `jitter` of random slack.

use std::time::Duration;

use crate::config::ReconcileConfig;

/// Exponential backoff policy
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000), 0.1)
    }
}

impl Backoff {
    /// Create a policy; `max` is raised to `base` and jitter clamped to `[0, 1]`
    #[must_use]
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: if jitter.is_finite() {
                jitter.clamp(0.0, 1.0)
            } else {
                0.0
            },
        }
    }

    /// Build from the `[reconcile]` configuration section
    #[must_use]
    pub fn from_config(config: &ReconcileConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
            config.retry_jitter,
        )
    }

    /// Delay before retry number `failures + 1` (`failures` is 0 for the first retry)
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        // 2^31 * base already exceeds any sane max; avoid overflowing the shift.
        let factor = 1u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
        let capped = self.base.saturating_mul(factor).min(self.max);

        if self.jitter <= 0.0 {
            return capped;
        }
        let slack = capped.mul_f64(rand::random::<f64>() * self.jitter);
        capped.saturating_add(slack).min(self.max)
    }

    /// Upper bound on any delay
    #[must_use]
    pub fn max(&self) -> Duration {
        self.max
    }
}
