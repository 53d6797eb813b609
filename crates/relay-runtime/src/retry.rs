//! Retry policies with constant or exponential backoff.

use std::future::Future;
use std::time::Duration;

/// Strategy for computing the delay before a retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Fixed delay between attempts
    Constant(Duration),
    /// Delay doubles each attempt: `base * 2^(attempt - 1)`, no jitter
    Exponential {
        base: Duration,
        cap: Option<Duration>,
    },
}

impl Backoff {
    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Constant(delay) => *delay,
            Self::Exponential { base, cap } => {
                let exponent = attempt.saturating_sub(1).min(20);
                let delay = base.saturating_mul(2_u32.saturating_pow(exponent));
                match cap {
                    Some(cap) => delay.min(*cap),
                    None => delay,
                }
            }
        }
    }
}

/// Attempt limit plus backoff strategy for a retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: Option<u32>,
    backoff: Backoff,
}

impl RetryPolicy {
    /// Policy with a bounded number of attempts (clamped to at least 1)
    pub fn bounded(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            backoff,
        }
    }

    /// Policy that retries forever
    pub fn unbounded(backoff: Backoff) -> Self {
        Self {
            max_attempts: None,
            backoff,
        }
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.delay_for(attempt)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

/// Run `op` under the policy, retrying failures that `should_retry`
/// accepts while attempts remain.
///
/// Executes `op` at least once and returns the last outcome; failures
/// are never swallowed. The backoff sleep only blocks the calling task.
pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    mut op: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if policy.exhausted(attempt) || !should_retry(&error) {
                    return Err(error);
                }
                tokio::time::sleep(policy.delay_for(attempt)).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
