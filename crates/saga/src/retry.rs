//! Exponential backoff for saga steps.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};

/// Computes the delay that follows `current`.
///
/// Returns `min(cap, current * coefficient)`. With `coefficient >= 1` the
/// sequence produced by feeding the result back in is non-decreasing and
/// settles at `cap`.
pub fn next_retry_delay(current: Duration, coefficient: f64, cap: Duration) -> Duration {
    let scaled = current.as_secs_f64() * coefficient;
    // `min` also absorbs an infinite product.
    Duration::from_secs_f64(scaled.min(cap.as_secs_f64()))
}

/// Retry configuration of a saga step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionOptions {
    /// Retries after the first attempt (0 = a single attempt).
    pub max_retries: u32,
    /// Delay before the first retry, and the wait bound of the first attempt.
    pub retry_interval: Duration,
    /// Multiplier applied to the interval after every retry.
    pub backoff_coefficient: f64,
    /// Ceiling for the interval.
    pub max_retry_interval: Duration,
}

impl Default for StepExecutionOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_interval: Duration::from_secs(5),
            backoff_coefficient: 2.0,
            max_retry_interval: Duration::from_secs(60),
        }
    }
}

impl StepExecutionOptions {
    /// Rejects options that would make the backoff shrink or stall.
    pub fn validate(&self) -> Result<()> {
        if self.retry_interval.is_zero() {
            return Err(SagaError::InvalidOptions(
                "retry_interval must be greater than zero".to_string(),
            ));
        }
        if !self.backoff_coefficient.is_finite() || self.backoff_coefficient < 1.0 {
            return Err(SagaError::InvalidOptions(format!(
                "backoff_coefficient must be a finite number >= 1, got {}",
                self.backoff_coefficient
            )));
        }
        if self.max_retry_interval < self.retry_interval {
            return Err(SagaError::InvalidOptions(format!(
                "max_retry_interval ({:?}) must not be below retry_interval ({:?})",
                self.max_retry_interval, self.retry_interval
            )));
        }
        Ok(())
    }

    /// Delay before retry `retry` (0-based).
    ///
    /// Equals `min(max_retry_interval, retry_interval * backoff_coefficient^retry)`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let mut delay = self.retry_interval.min(self.max_retry_interval);
        for _ in 0..retry {
            if delay >= self.max_retry_interval {
                break;
            }
            delay = next_retry_delay(delay, self.backoff_coefficient, self.max_retry_interval);
        }
        delay
    }

    /// Iterates over the delays of every retry these options allow.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|retry| self.delay_for_retry(retry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(initial_ms: u64, coefficient: f64, cap_ms: u64, retries: u32) -> StepExecutionOptions {
        StepExecutionOptions {
            max_retries: retries,
            retry_interval: Duration::from_millis(initial_ms),
            backoff_coefficient: coefficient,
            max_retry_interval: Duration::from_millis(cap_ms),
        }
    }

    #[test]
    fn test_defaults() {
        let opts = StepExecutionOptions::default();
        assert_eq!(opts.max_retries, 3);
        assert_eq!(opts.retry_interval, Duration::from_secs(5));
        assert!((opts.backoff_coefficient - 2.0).abs() < f64::EPSILON);
        assert_eq!(opts.max_retry_interval, Duration::from_secs(60));
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_next_delay_is_capped() {
        let cap = Duration::from_secs(60);
        assert_eq!(
            next_retry_delay(Duration::from_secs(5), 2.0, cap),
            Duration::from_secs(10)
        );
        assert_eq!(next_retry_delay(Duration::from_secs(40), 2.0, cap), cap);
        assert_eq!(next_retry_delay(cap, 2.0, cap), cap);
        assert_eq!(next_retry_delay(cap, f64::MAX, cap), cap);
    }

    #[test]
    fn test_default_schedule() {
        let opts = StepExecutionOptions::default();
        let delays: Vec<_> = opts.delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20)
            ]
        );
    }

    #[test]
    fn test_delay_formula_matches_closed_form() {
        let opts = options(5_000, 2.0, 60_000, 10);
        for retry in 0..10 {
            let expected = (5_000f64 * 2f64.powi(retry as i32)).min(60_000f64);
            assert_eq!(
                opts.delay_for_retry(retry),
                Duration::from_secs_f64(expected / 1000.0)
            );
        }
    }

    #[test]
    fn test_delays_are_non_decreasing_and_bounded() {
        let cases = [
            (1, 1.0, 1),
            (10, 1.0, 500),
            (10, 1.5, 500),
            (250, 3.0, 1_000),
            (7, 10.0, 100_000),
            (1_000, 2.0, 1_000),
        ];
        for (initial, coefficient, cap) in cases {
            let opts = options(initial, coefficient, cap, 40);
            opts.validate().unwrap();
            let delays: Vec<_> = opts.delays().collect();
            assert!(
                delays.windows(2).all(|w| w[0] <= w[1]),
                "non-monotonic for {initial}/{coefficient}/{cap}"
            );
            assert!(delays.iter().all(|d| *d <= Duration::from_millis(cap)));
        }
    }

    #[test]
    fn test_coefficient_one_keeps_interval_constant() {
        let opts = options(200, 1.0, 10_000, 5);
        assert!(opts.delays().all(|d| d == Duration::from_millis(200)));
    }

    #[test]
    fn test_zero_retries_has_no_delays() {
        let opts = options(200, 2.0, 10_000, 0);
        assert_eq!(opts.delays().count(), 0);
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        assert!(matches!(
            options(100, 0.5, 1_000, 3).validate(),
            Err(SagaError::InvalidOptions(_))
        ));
        assert!(matches!(
            options(100, f64::NAN, 1_000, 3).validate(),
            Err(SagaError::InvalidOptions(_))
        ));
        assert!(matches!(
            options(2_000, 2.0, 1_000, 3).validate(),
            Err(SagaError::InvalidOptions(_))
        ));
        assert!(matches!(
            options(0, 2.0, 1_000, 3).validate(),
            Err(SagaError::InvalidOptions(_))
        ));
    }
}
