//! Retry and backoff policies.
//!
//! The binding actuator, the API-server watch loop and the database connect
//! loop share the delay schedule defined here.

use std::time::Duration;

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    None,

    /// Wait the same delay before every retry.
    Fixed(Duration),

    /// Double the delay after every attempt, starting at `base`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay to wait after the given zero-based failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt.min(31));
                base.saturating_mul(factor).min(*max)
            }
        }
    }
}

/// Retry policy for binding calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total binding calls allowed per decision, including the first.
    pub max_attempts: u32,

    /// Delay between attempts.
    pub backoff: Backoff,

    /// Re-read the live object before retrying. A first attempt that failed
    /// after the bind landed then counts as success, and a unit that was
    /// replaced or deleted is not retried.
    pub verify_before_retry: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Backoff::None,
            verify_before_retry: false,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Attempts actually allowed; zero is treated as one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}
