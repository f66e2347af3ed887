use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// In-process retry settings for infrastructure calls (DLQ publishing, dedup
/// bookkeeping). Message delivery retries use [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: u64,
}

/// Delivery retry policy carried by the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_delay: Duration::from_secs(2 * 60 * 60),
        }
    }
}

impl RetryPolicy {
    /// `min(base * multiplier^retry_count, max_delay)`
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        Duration::from_secs_f64(secs.max(0.0))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryState {
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Re-publish with this state.
    Retry(RetryState),
    /// Retries are used up; the state records the final failure.
    Exhausted(RetryState),
}

/// Advances the retry state machine after a failed delivery attempt.
///
/// The attempt that just failed is failure number `retry_count + 1`. Once that
/// reaches `max_retries` the message is exhausted and belongs in the DLQ.
pub fn compute_next_retry(
    state: &RetryState,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
    error: &str,
) -> RetryDecision {
    let failures = state.retry_count.saturating_add(1);

    let mut next = RetryState {
        retry_count: state.retry_count,
        last_error: Some(error.to_string()),
        last_retry_at: Some(now),
        next_retry_at: None,
    };

    if failures >= policy.max_retries {
        return RetryDecision::Exhausted(next);
    }

    let delay = TimeDelta::from_std(policy.backoff(state.retry_count)).unwrap_or(TimeDelta::MAX);

    next.retry_count = failures;
    next.next_retry_at = Some(
        now.checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
    );

    RetryDecision::Retry(next)
}
