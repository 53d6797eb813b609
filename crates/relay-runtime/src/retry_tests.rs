//! Tests for retry policies and the retry driver.

use super::*;
use crate::error::RelayError;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::Instant;

fn timeout_error() -> RelayError {
    RelayError::Timeout {
        duration: Duration::from_millis(500),
    }
}

#[test]
fn test_exponential_backoff_progression() {
    let backoff = Backoff::Exponential {
        base: Duration::from_millis(100),
        cap: None,
    };

    assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
    assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
    assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
    assert_eq!(backoff.delay_for(4), Duration::from_millis(800));

    // Strictly increasing
    for attempt in 1..10 {
        assert!(backoff.delay_for(attempt + 1) > backoff.delay_for(attempt));
    }
}

#[test]
fn test_exponential_backoff_cap() {
    let backoff = Backoff::Exponential {
        base: Duration::from_millis(100),
        cap: Some(Duration::from_secs(1)),
    };

    assert_eq!(backoff.delay_for(4), Duration::from_millis(800));
    assert_eq!(backoff.delay_for(5), Duration::from_secs(1));
    assert_eq!(backoff.delay_for(12), Duration::from_secs(1));
}

#[test]
fn test_constant_backoff() {
    let backoff = Backoff::Constant(Duration::from_secs(1));
    for attempt in 1..5 {
        assert_eq!(backoff.delay_for(attempt), Duration::from_secs(1));
    }
}

#[test]
fn test_bounded_policy_clamps_to_one_attempt() {
    let policy = RetryPolicy::bounded(0, Backoff::Constant(Duration::ZERO));
    assert_eq!(policy.max_attempts(), Some(1));
}

#[tokio::test]
async fn test_retry_succeeds_on_nth_attempt() {
    let calls = AtomicU32::new(0);
    let policy = RetryPolicy::bounded(5, Backoff::Constant(Duration::ZERO));

    let result: Result<u32, RelayError> = retry(
        &policy,
        || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(timeout_error())
                } else {
                    Ok(n)
                }
            }
        },
        |error| error.is_transient(),
    )
    .await;

    assert_eq!(result.unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_stops_after_max_attempts() {
    let calls = AtomicU32::new(0);
    let policy = RetryPolicy::bounded(5, Backoff::Constant(Duration::ZERO));

    let result: Result<(), RelayError> = retry(
        &policy,
        || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(timeout_error()) }
        },
        |error| error.is_transient(),
    )
    .await;

    assert!(matches!(result, Err(RelayError::Timeout { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 5, "exactly max_attempts calls");
}

#[tokio::test]
async fn test_retry_respects_should_retry() {
    let calls = AtomicU32::new(0);
    let policy = RetryPolicy::bounded(5, Backoff::Constant(Duration::ZERO));

    let result: Result<(), RelayError> = retry(
        &policy,
        || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(RelayError::Validation(
                    crate::error::ValidationError::Rejected {
                        message: "bad destination".to_string(),
                    },
                ))
            }
        },
        |error| error.is_transient(),
    )
    .await;

    assert!(matches!(result, Err(RelayError::Validation(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1, "no retry on permanent error");
}

#[tokio::test(start_paused = true)]
async fn test_retry_sleeps_exponentially() {
    let calls = AtomicU32::new(0);
    let policy = RetryPolicy::bounded(
        5,
        Backoff::Exponential {
            base: Duration::from_millis(100),
            cap: None,
        },
    );

    let started = Instant::now();
    let result: Result<(), RelayError> = retry(
        &policy,
        || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(timeout_error())
                } else {
                    Ok(())
                }
            }
        },
        |error| error.is_transient(),
    )
    .await;

    // Slept ~100ms after attempt 1 and ~200ms after attempt 2
    assert!(result.is_ok());
    assert_eq!(started.elapsed(), Duration::from_millis(300));
}

#[tokio::test]
async fn test_unbounded_policy_keeps_retrying() {
    let calls = AtomicU32::new(0);
    let policy = RetryPolicy::unbounded(Backoff::Constant(Duration::ZERO));

    let result: Result<u32, RelayError> = retry(
        &policy,
        || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 20 {
                    Err(timeout_error())
                } else {
                    Ok(n)
                }
            }
        },
        |error| error.is_transient(),
    )
    .await;

    assert_eq!(result.unwrap(), 20);
}
