//! Scenario tests for the concurrency controller
//!
//! Time is paused so exponential backoff resolves instantly.

use super::ConcurrencyController;
use crate::config::ConcurrencyConfig;
use crate::error::ImpactError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Tracks how many tasks are unsettled at once
#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn test_never_exceeds_ceiling() {
    let controller = ConcurrencyController::new(ConcurrencyConfig {
        max_concurrency: 5,
        ..Default::default()
    });
    let in_flight = Arc::new(InFlight::default());

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let in_flight = in_flight.clone();
            let task = move || {
                let in_flight = in_flight.clone();
                async move {
                    in_flight.enter();
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    in_flight.leave();
                    Ok::<_, ImpactError>(i * 2)
                }
            };
            (format!("task-{}", i), task)
        })
        .collect();

    let results = controller.run_bounded(tasks).await;

    assert_eq!(results.len(), 10);
    assert_eq!(in_flight.peak.load(Ordering::SeqCst), 5);
    for (i, (key, result)) in results.into_iter().enumerate() {
        assert_eq!(key, format!("task-{}", i));
        assert_eq!(result.unwrap(), i * 2);
    }
    assert_eq!(controller.available_permits(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_task_does_not_block_siblings() {
    let controller = ConcurrencyController::default();
    let attempts = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let attempts = attempts.clone();
            let task = move || {
                let attempts = attempts.clone();
                async move {
                    if i == 3 {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err(ImpactError::TransientFetch("429 Too Many Requests".into()))
                    } else {
                        Ok(i)
                    }
                }
            };
            (i, task)
        })
        .collect();

    let results = controller.run_bounded(tasks).await;

    // first attempt + 7 retries
    assert_eq!(attempts.load(Ordering::SeqCst), 8);
    for (key, result) in results {
        if key == 3 {
            match result {
                Err(ImpactError::RetriesExhausted { attempts, last }) => {
                    assert_eq!(attempts, 8);
                    assert!(matches!(*last, ImpactError::TransientFetch(_)));
                }
                other => panic!("expected exhaustion, got {:?}", other),
            }
        } else {
            assert_eq!(result.unwrap(), key);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_recovers_after_transient_failures() {
    let controller = ConcurrencyController::default();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let result = controller
        .run("flaky", move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ImpactError::TransientFetch("503".into()))
                } else {
                    Ok("observations")
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "observations");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_delays_are_exponential() {
    let controller = ConcurrencyController::new(ConcurrencyConfig {
        max_retries: 2,
        backoff_base_secs: 5.0,
        ..Default::default()
    });
    let start = tokio::time::Instant::now();

    let result: Result<(), _> = controller
        .run("always-busy", || async {
            Err(ImpactError::TransientFetch("busy".into()))
        })
        .await;

    assert!(result.is_err());
    // 5s + 25s of backoff between three attempts
    assert!(start.elapsed() >= Duration::from_secs(30));
    assert!(start.elapsed() < Duration::from_secs(31));
}

#[tokio::test(start_paused = true)]
async fn test_permanent_error_is_not_retried() {
    let controller = ConcurrencyController::default();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let result: Result<(), _> = controller
        .run("bad-selector", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ImpactError::PermanentConfig("unknown subscription".into()))
            }
        })
        .await;

    assert!(matches!(result, Err(ImpactError::PermanentConfig(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_timeout_is_retried() {
    let controller = ConcurrencyController::new(ConcurrencyConfig {
        attempt_timeout_secs: 1.0,
        max_retries: 3,
        backoff_base_secs: 1.0,
        ..Default::default()
    });
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let result = controller
        .run("slow-then-fast", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok(42)
            }
        })
        .await;

    assert_eq!(result.unwrap(), 42);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_empty_round() {
    let controller = ConcurrencyController::default();
    let tasks: Vec<(String, fn() -> std::future::Ready<crate::Result<u8>>)> = Vec::new();
    let results = controller.run_bounded(tasks).await;
    assert!(results.is_empty());
}
