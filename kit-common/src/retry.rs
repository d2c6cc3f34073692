//! # Retry
//!
//! Module providing a `RetryPolicy` struct to configure retrying of stream reads,
//! store writes and alert deliveries.
use std::time;

use rand::Rng;

#[derive(Clone, Debug, PartialEq)]
/// A retry policy to determine backoff and attempt limits for an external call.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
    /// Total number of attempts, including the first one. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Fraction (0.0 to 1.0) of the interval to randomize in both directions.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Determine the interval to wait after a failed attempt, without jitter.
    /// Attempts are 1-based: the interval after the first failure is `initial_interval`.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let factor = self
            .backoff_coefficient
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        let candidate_interval = self
            .initial_interval
            .checked_mul(factor)
            .unwrap_or(time::Duration::MAX);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }

    /// Same as `retry_interval`, randomized by `jitter` and still capped by `maximum_interval`.
    pub fn jittered_interval(&self, attempt: u32) -> time::Duration {
        let interval = self.retry_interval(attempt);
        if self.jitter <= 0.0 || interval.is_zero() {
            return interval;
        }

        let spread = self.jitter.min(1.0);
        let factor = 1.0 + rand::thread_rng().gen_range(-spread..=spread);
        let jittered = time::Duration::try_from_secs_f64(interval.as_secs_f64() * factor.max(0.0))
            .unwrap_or(interval);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(jittered, max_interval),
            None => jittered,
        }
    }

    /// Whether another attempt may be made after `attempts` have already been made.
    pub fn has_attempts_left(&self, attempts: u32) -> bool {
        match self.max_attempts {
            Some(max_attempts) => attempts < max_attempts,
            None => true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
    pub max_attempts: Option<u32>,
    pub jitter: f64,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(200),
            maximum_interval: None,
            max_attempts: None,
            jitter: 0.0,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> RetryPolicyBuilder {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn jitter(mut self, jitter: f64) -> RetryPolicyBuilder {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            max_attempts: self.max_attempts,
            jitter: self.jitter,
        }
    }
}
