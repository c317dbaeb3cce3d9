//! Integration tests for common Bulwark workflows.
//!
//! These tests run operations through composed policies and memoizers the
//! way an application would.

use bulwark::bulwark_cache::{MemoizeOptions, memoize_async, memoize_result_async_with, memoize_with};
use bulwark::prelude::*;
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

// =============================================================================
// Composed Policies
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_retry_recovers_after_transient_failures() {
    let policy = ResiliencePolicy::builder()
        .with_retry(RetryConfig::new(3).with_backoff(Backoff::constant(Duration::from_millis(10))))
        .build()
        .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let start = Instant::now();

    let result = policy
        .execute(move |_cancel| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt < 3 {
                    Err(Error::external_service(format!("attempt {attempt} failed")))
                } else {
                    Ok("payload")
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "payload");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(start.elapsed() >= Duration::from_millis(20));
}

#[tokio::test(start_paused = true)]
async fn test_overall_timeout_bounds_retries() {
    let policy = ResiliencePolicy::builder()
        .with_retry(
            RetryConfig::new(100).with_backoff(Backoff::constant(Duration::from_millis(50))),
        )
        .with_timeout(TimeoutConfig::new(Duration::from_millis(150)))
        .build()
        .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result: Outcome<()> = policy
        .execute(move |_cancel| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::internal("always fails")) }
        })
        .await;

    match result {
        Err(Error::Timeout { timeout, elapsed }) => {
            assert_eq!(timeout, Duration::from_millis(150));
            assert!(elapsed >= timeout);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(calls.load(Ordering::SeqCst) < 100);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_behind_retry_fails_fast_once_open() {
    let policy = ResiliencePolicy::builder()
        .with_circuit_breaker(
            CircuitBreakerConfig::new("inventory")
                .with_failure_threshold(3)
                .with_reset_timeout(Duration::from_secs(10)),
        )
        .with_retry(RetryConfig::new(3))
        .build()
        .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let op = |calls: Arc<AtomicU32>| {
        move |_cancel: CancellationToken| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::external_service("inventory down")) }
        }
    };

    let first = policy.execute(op(calls.clone())).await;
    assert!(matches!(first, Err(Error::ExternalService(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let breaker = policy.circuit_breaker().unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);

    // Every attempt of the next call is rejected without reaching the operation
    let second = policy.execute(op(calls.clone())).await;
    assert!(matches!(second, Err(Error::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_caller_cancellation_is_not_a_timeout() {
    let policy = ResiliencePolicy::builder()
        .with_timeout(TimeoutConfig::new(Duration::from_secs(5)))
        .with_retry(RetryConfig::new(10).with_backoff(Backoff::constant(Duration::from_secs(1))))
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        trigger.cancel();
    });

    let result = policy
        .execute_with_cancel(
            |_op_cancel| async { Err::<(), _>(Error::internal("nope")) },
            &cancel,
        )
        .await;

    assert!(matches!(result, Err(Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn test_bulkhead_limits_concurrent_calls() {
    let policy = ResiliencePolicy::builder()
        .with_bulkhead(BulkheadConfig::new("reports", 2).with_max_queue_size(1))
        .build()
        .unwrap();
    let policy = Arc::new(policy);

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let calls = (0..4).map(|_| {
        let policy = policy.clone();
        let running = running.clone();
        let peak = peak.clone();
        async move {
            policy
                .execute_value(move |_cancel| {
                    let running = running.clone();
                    let peak = peak.clone();
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    }
                })
                .await
        }
    });

    let results = join_all(calls).await;

    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(Error::BulkheadRejected { max_concurrency: 2, max_queue_size: 1 })))
        .count();
    assert_eq!(rejected, 1);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Memoization
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_async_single_flight() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let fetch = memoize_async(move |key: String| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Arc::new(format!("value for {key}"))
        }
    });

    let values = join_all((0..16).map(|_| fetch.call("config".to_string()))).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
}

#[tokio::test(start_paused = true)]
async fn test_memoize_expiration() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let now = memoize_with(
        move |_: ()| counter.fetch_add(1, Ordering::SeqCst),
        MemoizeOptions::new().with_expiration(Duration::from_secs(60)),
    )
    .unwrap();

    assert_eq!(now.call(()), 0);
    tokio::time::advance(Duration::from_secs(59)).await;
    assert_eq!(now.call(()), 0);
    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(now.call(()), 1);
}

#[tokio::test(start_paused = true)]
async fn test_memoized_call_through_policy() {
    let policy = Arc::new(
        ResiliencePolicy::builder()
            .with_retry(RetryConfig::new(2))
            .build()
            .unwrap(),
    );

    let upstream_calls = Arc::new(AtomicU32::new(0));
    let counter = upstream_calls.clone();
    let guarded = policy.clone();
    let lookup = memoize_result_async_with(
        move |id: u64| {
            let policy = guarded.clone();
            let counter = counter.clone();
            async move {
                policy
                    .execute(move |_cancel| {
                        let n = counter.fetch_add(1, Ordering::SeqCst);
                        async move {
                            if n == 0 {
                                Err(Error::external_service("cold start"))
                            } else {
                                Ok(id * 2)
                            }
                        }
                    })
                    .await
            }
        },
        MemoizeOptions::new().with_max_size(100),
    )
    .unwrap();

    assert_eq!(lookup.call(21).await.unwrap(), 42);
    assert_eq!(lookup.call(21).await.unwrap(), 42);
    assert_eq!(upstream_calls.load(Ordering::SeqCst), 2);
}
