use super::*;

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, PartialEq)]
enum TestError {
    Transient(u32),
    Permanent,
}

impl Retryable for TestError {
    fn is_retryable(&self) -> bool {
        matches!(self, TestError::Transient(_))
    }
}

/// Operation that fails with `Transient(n)` on call n until `succeed_on`.
async fn run(policy: &RetryPolicy, succeed_on: u32, calls: &AtomicU32) -> Result<u32, TestError> {
    policy
        .execute(|| async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= succeed_on {
                Ok(n)
            } else {
                Err(TestError::Transient(n))
            }
        })
        .await
}

#[test]
fn test_default_policy() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.max_attempts, 5);
    assert_eq!(policy.backoff, Backoff::Immediate);
}

#[tokio::test]
async fn test_success_first_attempt() {
    let calls = AtomicU32::new(0);
    let result = run(&RetryPolicy::default(), 1, &calls).await;
    assert_eq!(result, Ok(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_success_on_each_attempt_up_to_bound() {
    for n in 1..=5 {
        let calls = AtomicU32::new(0);
        let result = run(&RetryPolicy::default(), n, &calls).await;
        assert_eq!(result, Ok(n));
        assert_eq!(calls.load(Ordering::SeqCst), n, "succeed on attempt {}", n);
    }
}

#[tokio::test]
async fn test_exhausted_returns_last_error() {
    let calls = AtomicU32::new(0);
    let result = run(&RetryPolicy::default(), u32::MAX, &calls).await;
    assert_eq!(result, Err(TestError::Transient(5)));
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_permanent_error_short_circuits() {
    let calls = AtomicU32::new(0);
    let result: Result<(), TestError> = RetryPolicy::default()
        .execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Permanent)
        })
        .await;
    assert_eq!(result, Err(TestError::Permanent));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_permanent_after_transient_stops() {
    let calls = AtomicU32::new(0);
    let result: Result<(), TestError> = RetryPolicy::default()
        .execute(|| async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(TestError::Transient(n))
            } else {
                Err(TestError::Permanent)
            }
        })
        .await;
    assert_eq!(result, Err(TestError::Permanent));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_zero_attempts_still_runs_once() {
    let calls = AtomicU32::new(0);
    let result = run(&RetryPolicy::immediate(0), u32::MAX, &calls).await;
    assert_eq!(result, Err(TestError::Transient(1)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fixed_backoff_sleeps_between_attempts() {
    let policy = RetryPolicy::immediate(3).with_backoff(Backoff::Fixed { delay_ms: 100 });
    let calls = AtomicU32::new(0);
    let started = tokio::time::Instant::now();

    let result = run(&policy, u32::MAX, &calls).await;

    assert_eq!(result, Err(TestError::Transient(3)));
    // Two sleeps: after attempts 1 and 2, none after the last.
    assert_eq!(started.elapsed(), Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn test_exponential_backoff_is_capped() {
    let policy = RetryPolicy::immediate(4).with_backoff(Backoff::Exponential {
        min_delay_ms: 100,
        max_delay_ms: 150,
        jitter: false,
    });
    let calls = AtomicU32::new(0);
    let started = tokio::time::Instant::now();

    let result = run(&policy, u32::MAX, &calls).await;

    assert_eq!(result, Err(TestError::Transient(4)));
    // 100ms, then 200ms capped to 150ms, twice.
    assert_eq!(started.elapsed(), Duration::from_millis(400));
}

#[test]
fn test_backoff_deserializes_tagged() {
    let policy: RetryPolicy = serde_json::from_str(
        r#"{"max_attempts": 3, "backoff": {"type": "fixed", "delay_ms": 25}}"#,
    )
    .unwrap();
    assert_eq!(policy.max_attempts, 3);
    assert_eq!(policy.backoff, Backoff::Fixed { delay_ms: 25 });

    let policy: RetryPolicy = serde_json::from_str("{}").unwrap();
    assert_eq!(policy, RetryPolicy::default());
}
