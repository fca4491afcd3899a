use std::time::Duration;

use crate::data::RetryPolicy;
use crate::error::ErrorClass;

/// Calculate the delay before a retry attempt using capped exponential backoff.
///
/// The delay formula is: `min(max_delay, base_delay * multiplier^(retry - 1))`
///
/// # Arguments
///
/// * `retry` - The retry number (1-based: 1 = first retry). Zero yields no delay.
/// * `policy` - The backoff schedule
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use htfs::core::retry_delay;
/// use htfs::RetryPolicy;
///
/// let policy = RetryPolicy::default()
///     .base_delay(Duration::from_millis(100))
///     .max_delay(Duration::from_millis(350));
///
/// assert_eq!(retry_delay(1, &policy), Duration::from_millis(100));
/// assert_eq!(retry_delay(2, &policy), Duration::from_millis(200));
/// assert_eq!(retry_delay(3, &policy), Duration::from_millis(350));
/// ```
pub fn retry_delay(retry: u32, policy: &RetryPolicy) -> Duration {
    if retry == 0 {
        return Duration::ZERO;
    }

    let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
    let nominal = policy.base_delay.as_secs_f64() * policy.multiplier.powi(exponent);
    let cap = policy.max_delay.as_secs_f64();

    if !nominal.is_finite() || nominal >= cap {
        policy.max_delay
    } else {
        Duration::try_from_secs_f64(nominal.max(0.0)).unwrap_or(policy.max_delay)
    }
}

/// Spread `delay` by `jitter` using a uniform `sample` in `[0, 1)`.
///
/// The result lies within `delay * (1 ± jitter / 2)`.
pub fn jittered(delay: Duration, jitter: f64, sample: f64) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let secs = delay.as_secs_f64();
    let offset = secs * jitter * (sample - 0.5);
    Duration::try_from_secs_f64((secs + offset).max(0.0)).unwrap_or(delay)
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait, then try again.
    Backoff(Duration),
    /// Obtain a fresh URL, then try again immediately.
    Renew,
    /// Surface the error.
    GiveUp,
}

/// Attempt bookkeeping for one logical operation.
///
/// Pure: it never sleeps or touches the network, so the schedule can be
/// checked without either.
#[derive(Debug)]
pub struct RetryState<'p> {
    policy: &'p RetryPolicy,
    attempts: u32,
    renewed: bool,
}

impl<'p> RetryState<'p> {
    /// Starts the bookkeeping with the first attempt in flight.
    pub fn new(policy: &'p RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 1,
            renewed: false,
        }
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// True once no further attempt is allowed.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }

    /// Records a failure of the current attempt and decides the next step.
    pub fn on_failure(&mut self, class: ErrorClass) -> RetryDecision {
        match class {
            ErrorClass::Fatal => RetryDecision::GiveUp,
            _ if self.is_exhausted() => RetryDecision::GiveUp,
            // a renewed URL that is rejected again is not worth another round
            ErrorClass::Renew if self.renewed => RetryDecision::GiveUp,
            ErrorClass::Renew => {
                self.renewed = true;
                self.attempts += 1;
                RetryDecision::Renew
            }
            ErrorClass::Retryable => {
                let delay = retry_delay(self.attempts, self.policy);
                self.attempts += 1;
                RetryDecision::Backoff(delay)
            }
        }
    }
}
