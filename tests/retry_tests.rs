use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use anyhow::{Result, anyhow};
use chrono::{TimeDelta, Utc};
use dispatch_service::{
    clients::rbmq::Topic,
    error::BackendError,
    models::retry::{RetryConfig, RetryDecision, RetryPolicy, RetryState, compute_next_retry},
    utils::retry_with_backoff,
    worker::Disposition,
};
use tokio::time::Instant;

use crate::common::{ScriptedHandler, approved_intent, harness};

/// Test: Successful operations complete without retry
#[tokio::test]
async fn test_successful_operation_no_retry() -> Result<()> {
    let config = RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 100,
        max_delay_ms: 1000,
        backoff_multiplier: 2,
    };

    let attempt_count = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempt_count);

    let result = retry_with_backoff(&config, || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>("success")
        }
    })
    .await?;

    assert_eq!(result, "success");
    assert_eq!(
        attempt_count.load(Ordering::SeqCst),
        1,
        "Should only attempt once"
    );

    Ok(())
}

/// Test: Transient failures are retried with backoff
#[tokio::test]
async fn test_transient_failures_are_retried() -> Result<()> {
    let config = RetryConfig {
        max_attempts: 5,
        initial_delay_ms: 100,
        max_delay_ms: 1000,
        backoff_multiplier: 2,
    };

    let attempt_count = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempt_count);

    let result = retry_with_backoff(&config, || {
        let counter = Arc::clone(&counter);
        async move {
            let attempts = counter.fetch_add(1, Ordering::SeqCst);

            // Fail first 2 attempts, succeed on 3rd
            if attempts < 2 {
                Err(anyhow!("Transient error"))
            } else {
                Ok("success")
            }
        }
    })
    .await?;

    assert_eq!(result, "success");
    assert_eq!(
        attempt_count.load(Ordering::SeqCst),
        3,
        "Should retry 2 times then succeed"
    );

    Ok(())
}

/// Test: Permanent failures exhaust retries
#[tokio::test]
async fn test_permanent_failure_exhausts_retries() -> Result<()> {
    let config = RetryConfig {
        max_attempts: 4,
        initial_delay_ms: 50,
        max_delay_ms: 500,
        backoff_multiplier: 2,
    };

    let attempt_count = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempt_count);

    let result = retry_with_backoff(&config, || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<String, _>(anyhow!("Permanent failure"))
        }
    })
    .await;

    assert!(result.is_err(), "Should fail after max attempts");
    assert_eq!(
        attempt_count.load(Ordering::SeqCst),
        4,
        "Should attempt exactly max_attempts times"
    );

    Ok(())
}

/// Test: Retry delays follow exponential backoff
#[tokio::test]
async fn test_exponential_backoff_timing() -> Result<()> {
    let config = RetryConfig {
        max_attempts: 4,
        initial_delay_ms: 100,
        max_delay_ms: 1000,
        backoff_multiplier: 2,
    };

    let start = Instant::now();
    let attempt_times = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let times = Arc::clone(&attempt_times);

    let _ = retry_with_backoff(&config, || {
        let times = Arc::clone(&times);
        async move {
            let elapsed = start.elapsed().as_millis();
            times.lock().await.push(elapsed);
            Err::<String, _>(anyhow!("Fail"))
        }
    })
    .await;

    let times = attempt_times.lock().await;

    assert_eq!(times.len(), 4);

    assert!(times[0] < 50, "First attempt should be immediate");

    for i in 1..times.len() {
        let delay = times[i] - times[i - 1];
        let expected_min =
            (config.initial_delay_ms * config.backoff_multiplier.pow(i as u32 - 1)) * 8 / 10;
        let expected_max =
            (config.initial_delay_ms * config.backoff_multiplier.pow(i as u32 - 1)) * 12 / 10;

        assert!(
            delay >= expected_min as u128 && delay <= expected_max as u128,
            "Delay {} should be between {} and {} (actual: {})",
            i,
            expected_min,
            expected_max,
            delay
        );
    }

    Ok(())
}

/// Test: Max delay cap is respected
#[tokio::test]
async fn test_max_delay_cap_respected() -> Result<()> {
    let config = RetryConfig {
        max_attempts: 6,
        initial_delay_ms: 100,
        max_delay_ms: 300,
        backoff_multiplier: 2,
    };

    let start = Instant::now();
    let attempt_times = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let times = Arc::clone(&attempt_times);

    let _ = retry_with_backoff(&config, || {
        let times = Arc::clone(&times);
        async move {
            let elapsed = start.elapsed().as_millis();
            times.lock().await.push(elapsed);
            Err::<String, _>(anyhow!("Fail"))
        }
    })
    .await;

    let times = attempt_times.lock().await;

    for i in 3..times.len() {
        let delay = times[i] - times[i - 1];
        assert!(
            delay <= (config.max_delay_ms * 12 / 10) as u128,
            "Delay should not exceed max_delay_ms cap"
        );
    }

    Ok(())
}

/// Test: Retry behavior under concurrent operations
#[tokio::test]
async fn test_concurrent_retry_operations() -> Result<()> {
    let config = Arc::new(RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 50,
        max_delay_ms: 500,
        backoff_multiplier: 2,
    });

    let total_success = Arc::new(AtomicU32::new(0));
    let mut handles = vec![];

    for i in 0..10 {
        let config = Arc::clone(&config);
        let success_counter = Arc::clone(&total_success);

        let handle = tokio::spawn(async move {
            let attempt_count = Arc::new(AtomicU32::new(0));
            let counter = Arc::clone(&attempt_count);

            let result = retry_with_backoff(&config, || {
                let counter = Arc::clone(&counter);
                async move {
                    let attempts = counter.fetch_add(1, Ordering::SeqCst);

                    if i < 5 && attempts == 0 {
                        Err(anyhow!("First attempt fails"))
                    } else {
                        Ok("success")
                    }
                }
            })
            .await;

            if result.is_ok() {
                success_counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        handles.push(handle);
    }

    futures_util::future::join_all(handles).await;

    assert_eq!(
        total_success.load(Ordering::SeqCst),
        10,
        "All concurrent operations should eventually succeed"
    );

    Ok(())
}

/// Test: Retry state is independent per operation
#[tokio::test]
async fn test_retry_state_independence() -> Result<()> {
    let config = Arc::new(RetryConfig {
        max_attempts: 5,
        initial_delay_ms: 50,
        max_delay_ms: 500,
        backoff_multiplier: 2,
    });

    // Operation 1: Fails permanently
    let config1 = Arc::clone(&config);
    let handle1 = tokio::spawn(async move {
        retry_with_backoff(&config1, || async {
            Err::<String, _>(anyhow!("Always fail"))
        })
        .await
    });

    // Operation 2: Succeeds after 2 attempts
    let config2 = Arc::clone(&config);
    let counter2 = Arc::new(AtomicU32::new(0));
    let counter2_clone = Arc::clone(&counter2);
    let handle2 = tokio::spawn(async move {
        retry_with_backoff(&config2, || {
            let counter = Arc::clone(&counter2_clone);
            async move {
                let attempts = counter.fetch_add(1, Ordering::SeqCst);
                if attempts < 2 {
                    Err(anyhow!("Fail"))
                } else {
                    Ok("success")
                }
            }
        })
        .await
    });

    let (result1, result2) = tokio::join!(handle1, handle2);

    assert!(result1.unwrap().is_err(), "Operation 1 should fail");
    assert!(result2.unwrap().is_ok(), "Operation 2 should succeed");
    assert_eq!(
        counter2.load(Ordering::SeqCst),
        3,
        "Operation 2 should make 3 attempts"
    );

    Ok(())
}

/// Test: Delivery backoff grows with every retry and never passes the cap
#[tokio::test]
async fn test_delivery_backoff_is_monotonic_and_capped() -> Result<()> {
    let policy = RetryPolicy::default();

    let delays: Vec<_> = (0..12).map(|n| policy.backoff(n)).collect();
    for pair in delays.windows(2) {
        assert!(pair[0] <= pair[1], "Backoff must not shrink: {:?}", pair);
    }
    assert!(delays.iter().all(|d| *d <= policy.max_delay));
    assert_eq!(delays[11], policy.max_delay);

    Ok(())
}

/// Test: Every retry is scheduled after the previous attempt
#[tokio::test]
async fn test_retry_schedule_moves_forward() -> Result<()> {
    let policy = RetryPolicy::default();
    let now = Utc::now();
    let mut state = RetryState::default();

    for expected in 1..policy.max_retries {
        state = match compute_next_retry(&state, &policy, now, "503") {
            RetryDecision::Retry(next) => next,
            RetryDecision::Exhausted(s) => {
                return Err(anyhow!("exhausted early at retry {}", s.retry_count));
            }
        };

        assert_eq!(state.retry_count, expected);
        let due = state.next_retry_at.ok_or_else(|| anyhow!("no due time"))?;
        assert!(due > now);
        assert!(due - now <= TimeDelta::from_std(policy.max_delay)?);
    }

    assert!(matches!(
        compute_next_retry(&state, &policy, now, "503"),
        RetryDecision::Exhausted(_)
    ));

    Ok(())
}

/// Test: A retryable failure on one backend republishes only that backend,
/// and five consecutive failures dead-letter the message
#[tokio::test]
async fn test_partial_failure_retries_failed_backend_until_exhausted() -> Result<()> {
    let mail = ScriptedHandler::failing("mail", true, "request failed with status 503");
    let audit = ScriptedHandler::ok("audit");
    let h = harness(vec![mail.clone(), audit.clone()]);

    let message = h.builder.build(&approved_intent(&["mail", "audit"]))?;
    let original_id = message.id;

    assert_eq!(h.worker.process(message).await, Disposition::Ack);

    let retries = h.broker.published(Topic::Retry);
    assert_eq!(retries.len(), 1);
    let (_, retry) = &retries[0];
    assert_eq!(retry.id, original_id);
    assert_eq!(retry.backends, vec!["mail".to_string()]);
    assert_eq!(retry.retry_count, 1);
    assert!(retry.next_retry_at.is_some());
    assert!(
        retry
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("503"))
    );
    let first_failure_at = retry
        .first_failure_at
        .ok_or_else(|| anyhow!("first failure time not recorded"))?;
    assert!(first_failure_at >= retry.timestamp);

    // Keep feeding the scheduled retry back in until it lands in the DLQ.
    let mut attempts = 1;
    while let Some(retry) = h.broker.take_next(Topic::Retry) {
        assert_eq!(retry.first_failure_at, Some(first_failure_at));
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        assert_eq!(h.worker.process(retry).await, Disposition::Ack);
        attempts += 1;
        assert!(attempts <= 5, "Message was retried past the limit");
    }

    assert_eq!(attempts, 5);
    assert_eq!(mail.calls(), 5);
    assert_eq!(audit.calls(), 1, "Audit succeeded and must not be invoked again");

    let records = h.broker.dead_letter_records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.message_id, original_id);
    assert_eq!(record.failed_backends, vec!["mail".to_string()]);
    assert_eq!(record.retry_count, 4);
    assert!(record.failure_reason.starts_with("retries exhausted"));
    assert_eq!(record.first_failure_at, first_failure_at);
    assert!(record.first_failure_at < record.failed_at);

    assert_eq!(h.dedup.len(), 0, "Dead-lettering releases the dedup claim");

    Ok(())
}

/// Test: A backend that recovers stops the retry chain
#[tokio::test]
async fn test_recovered_backend_ends_retry_chain() -> Result<()> {
    let mail = ScriptedHandler::scripted(
        "mail",
        vec![Err(BackendError::retryable("mail", "send", "connection reset"))],
    );
    let h = harness(vec![mail.clone()]);

    let message = h.builder.build(&approved_intent(&["mail"]))?;
    assert_eq!(h.worker.process(message).await, Disposition::Ack);

    let retry = h
        .broker
        .take_next(Topic::Retry)
        .ok_or_else(|| anyhow!("retry was not published"))?;
    assert_eq!(h.worker.process(retry).await, Disposition::Ack);

    assert_eq!(mail.calls(), 2);
    assert!(h.broker.published(Topic::Retry).is_empty());
    assert_eq!(h.broker.dead_letter_count(), 0);

    Ok(())
}

/// Test: A retry that cannot be republished goes back to the broker
#[tokio::test]
async fn test_failed_retry_publish_requeues() -> Result<()> {
    let mail = ScriptedHandler::failing("mail", true, "timeout");
    let h = harness(vec![mail]);

    let message = h.builder.build(&approved_intent(&["mail"]))?;
    h.broker.fail_next_publishes(1);

    assert_eq!(h.worker.process(message).await, Disposition::Requeue);
    assert!(h.broker.published(Topic::Retry).is_empty());

    Ok(())
}
