//! Retry logic with exponential backoff
//!
//! The delay computation is a pure function of the attempt index and a jitter
//! sample, so its bounds can be checked without sleeping. [`RetryPolicy`]
//! binds it to a [`RetryConfig`] and draws the jitter sample from `rand`.
//!
//! Each call site owns its loop (the fetcher rotates endpoints, the tile
//! generator escalates parameters); [`retry_with_policy`] covers the plain case.

use crate::config::RetryConfig;
use crate::error::{Error, FetchError, ProcessError, ValidationError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Relative jitter applied around the nominal delay (±25%)
pub const JITTER_FRACTION: f64 = 0.25;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, rate limits, 5xx, memory exhaustion, archive races)
/// return `true`. Permanent failures (bad request, malformed input, corruption) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for FetchError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::RateLimited { .. }
                | FetchError::Timeout { .. }
                | FetchError::TransientService { .. }
                | FetchError::EmptyResponse { .. }
        )
    }
}

impl IsRetryable for ProcessError {
    fn is_retryable(&self) -> bool {
        match self {
            // Only resource exhaustion can be helped by more conservative parameters
            ProcessError::Failed { cause, .. } => cause.is_resource_exhaustion(),
            ProcessError::CriticalMemoryPressure { .. } => true,
            _ => false,
        }
    }
}

impl IsRetryable for ValidationError {
    fn is_retryable(&self) -> bool {
        match self {
            ValidationError::NotFound { .. }
            | ValidationError::Empty { .. }
            | ValidationError::Corrupt { .. }
            | ValidationError::StillIncomplete { .. }
            | ValidationError::Aborted { .. } => false,
            ValidationError::Unavailable(_)
            | ValidationError::MissingTables(_)
            | ValidationError::UnrecognizedLayout(_)
            | ValidationError::MissingFormat
            | ValidationError::NoTiles
            | ValidationError::InvalidZoom
            | ValidationError::UnreadableSample => true,
        }
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Fetch(e) => e.is_retryable(),
            Error::Process(e) => e.is_retryable(),
            Error::Validation(e) => e.is_retryable(),
            // Terminal by construction
            Error::Stage(_) => false,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            Error::Config { .. }
            | Error::Cache(_)
            | Error::Extraction { .. }
            | Error::Serialization(_) => false,
        }
    }
}

/// Compute the delay before retry number `attempt` (0-based)
///
/// Nominal delay is `min(base * 2^attempt, max)`. `jitter_sample` in `[0, 1]`
/// maps linearly onto a factor in `[1 - 0.25, 1 + 0.25]`; pass `0.5` for no
/// jitter. The result is always clamped to `[min, max]`.
pub fn backoff_delay(
    attempt: u32,
    base: Duration,
    max: Duration,
    min: Duration,
    jitter_sample: f64,
) -> Duration {
    let exponent = attempt.min(63) as i32;
    let nominal = (base.as_secs_f64() * 2f64.powi(exponent)).min(max.as_secs_f64());
    let sample = if jitter_sample.is_finite() {
        jitter_sample.clamp(0.0, 1.0)
    } else {
        0.5
    };
    let factor = 1.0 + JITTER_FRACTION * (2.0 * sample - 1.0);
    let lower = min.as_secs_f64().min(max.as_secs_f64());
    let secs = (nominal * factor).clamp(lower, max.as_secs_f64());
    Duration::from_secs_f64(secs)
}

/// Backoff policy bound to one call site
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for every delay
    pub max_delay: Duration,
    /// Lower bound for every delay
    pub min_delay: Duration,
    /// Attempts including the first
    pub max_attempts: u32,
    /// Whether jitter is applied
    pub jitter: bool,
}

impl RetryPolicy {
    /// Build a policy from configuration
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            min_delay: config.min_delay,
            max_attempts: config.max_attempts.max(1),
            jitter: config.jitter,
        }
    }

    /// Constant delay between a fixed number of attempts
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            min_delay: delay,
            max_attempts: max_attempts.max(1),
            jitter: false,
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let sample = if self.jitter {
            rand::thread_rng().gen_range(0.0..=1.0)
        } else {
            0.5
        };
        backoff_delay(
            attempt,
            self.base_delay,
            self.max_delay,
            self.min_delay,
            sample,
        )
    }

    /// Fresh per-operation state
    pub fn start(&self) -> RetryState {
        RetryState::new(self.max_attempts)
    }
}

/// Per-operation retry bookkeeping, never persisted
#[derive(Clone, Debug, PartialEq)]
pub struct RetryState {
    attempt: u32,
    max_attempts: u32,
    cumulative_delay: Duration,
    last_classification: Option<&'static str>,
}

impl RetryState {
    /// State before the first attempt
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts: max_attempts.max(1),
            cumulative_delay: Duration::ZERO,
            last_classification: None,
        }
    }

    /// Current attempt index (0-based)
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Attempts started so far
    pub fn attempts_made(&self) -> u32 {
        self.attempt + 1
    }

    /// Total time spent waiting between attempts
    pub fn cumulative_delay(&self) -> Duration {
        self.cumulative_delay
    }

    /// Classification of the most recent failure
    pub fn last_classification(&self) -> Option<&'static str> {
        self.last_classification
    }

    /// Whether another attempt fits in the budget
    pub fn can_retry(&self) -> bool {
        self.attempt + 1 < self.max_attempts
    }

    /// Record a failure of the current attempt
    pub fn record_failure(&mut self, classification: &'static str) {
        self.last_classification = Some(classification);
    }

    /// Advance to the next attempt after waiting `delay`
    ///
    /// Returns false (and leaves the index unchanged) when the budget is spent.
    pub fn advance(&mut self, delay: Duration) -> bool {
        if !self.can_retry() {
            return false;
        }
        self.attempt += 1;
        self.cumulative_delay += delay;
        true
    }
}

/// Run `operation` until it succeeds, fails permanently or the budget runs out
///
/// The closure receives the 0-based attempt index. Returns the last result
/// together with the final retry state.
pub async fn retry_with_policy<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut operation: F,
) -> (Result<T, E>, RetryState)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + crate::error::Classify + std::fmt::Display,
{
    let mut state = policy.start();

    loop {
        match operation(state.attempt()).await {
            Ok(value) => {
                if state.attempt() > 0 {
                    tracing::info!(
                        attempts = state.attempts_made(),
                        "Operation succeeded after retry"
                    );
                }
                return (Ok(value), state);
            }
            Err(e) => {
                state.record_failure(e.classification());
                if !e.is_retryable() {
                    tracing::debug!(error = %e, "Operation failed with non-retryable error");
                    return (Err(e), state);
                }
                if !state.can_retry() {
                    tracing::debug!(
                        error = %e,
                        attempts = state.attempts_made(),
                        "Operation failed after all retry attempts exhausted"
                    );
                    return (Err(e), state);
                }

                let delay = policy.delay_for(state.attempt());
                tracing::debug!(
                    error = %e,
                    attempt = state.attempt(),
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                state.advance(delay);
            }
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureCause;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_until_capped() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(60);
        let min = Duration::from_secs(1);

        assert_eq!(backoff_delay(0, base, max, min, 0.5), Duration::from_secs(2));
        assert_eq!(backoff_delay(1, base, max, min, 0.5), Duration::from_secs(4));
        assert_eq!(backoff_delay(4, base, max, min, 0.5), Duration::from_secs(32));
        assert_eq!(backoff_delay(5, base, max, min, 0.5), Duration::from_secs(60));
        assert_eq!(backoff_delay(200, base, max, min, 0.5), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_bounds_hold_for_all_jitter_samples() {
        let base = Duration::from_millis(700);
        let max = Duration::from_secs(60);
        let min = Duration::from_secs(1);

        for attempt in 0..40 {
            for step in 0..=20 {
                let sample = step as f64 / 20.0;
                let delay = backoff_delay(attempt, base, max, min, sample);
                assert!(delay >= min, "attempt {attempt} sample {sample}: {delay:?}");
                assert!(delay <= max, "attempt {attempt} sample {sample}: {delay:?}");
            }
        }
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let base = Duration::from_secs(8);
        let max = Duration::from_secs(600);
        let min = Duration::from_millis(1);

        let low = backoff_delay(0, base, max, min, 0.0);
        let high = backoff_delay(0, base, max, min, 1.0);
        assert_eq!(low, Duration::from_secs(6));
        assert_eq!(high, Duration::from_secs(10));
    }

    #[test]
    fn test_policy_delays_respect_bounds_with_random_jitter() {
        let policy = RetryPolicy::from_config(&RetryConfig::default());
        for attempt in 0..20 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= policy.min_delay);
            assert!(delay <= policy.max_delay);
        }
    }

    #[test]
    fn test_fixed_policy_is_constant() {
        let policy = RetryPolicy::fixed(Duration::from_millis(20), 3);
        assert_eq!(policy.delay_for(0), Duration::from_millis(20));
        assert_eq!(policy.delay_for(7), Duration::from_millis(20));
    }

    #[test]
    fn test_retry_state_is_monotonic_and_bounded() {
        let mut state = RetryState::new(3);
        assert_eq!(state.attempt(), 0);
        assert!(state.advance(Duration::from_secs(1)));
        assert!(state.advance(Duration::from_secs(2)));
        assert!(!state.advance(Duration::from_secs(4)));
        assert_eq!(state.attempt(), 2);
        assert_eq!(state.attempts_made(), 3);
        assert_eq!(state.cumulative_delay(), Duration::from_secs(3));

        state.record_failure("timeout");
        assert_eq!(state.last_classification(), Some("timeout"));
    }

    #[test]
    fn test_error_retryability() {
        assert!(
            FetchError::RateLimited {
                endpoint: "a".into(),
                message: String::new()
            }
            .is_retryable()
        );
        assert!(
            !FetchError::Permanent {
                endpoint: "a".into(),
                status: 400,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(
            ProcessError::Failed {
                cause: FailureCause::Killed,
                exit_code: None,
                detail: None
            }
            .is_retryable()
        );
        assert!(
            !ProcessError::Failed {
                cause: FailureCause::MalformedInput,
                exit_code: Some(1),
                detail: None
            }
            .is_retryable()
        );
        assert!(!ProcessError::TimedOut {
            after: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(ValidationError::NoTiles.is_retryable());
        assert!(
            !ValidationError::Corrupt {
                path: "x".into(),
                detail: String::new()
            }
            .is_retryable()
        );
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_millis(5), max_attempts)
    }

    #[tokio::test]
    async fn test_retry_transient_then_succeed() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let (result, state) = retry_with_policy(&fast_policy(3), |_| {
            let counter = counter_clone.clone();
            async move {
                let count = counter.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err(ValidationError::NoTiles)
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(state.attempt(), 2);
        assert_eq!(state.last_classification(), Some("validation-error"));
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let (result, state) = retry_with_policy(&fast_policy(2), |_| {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ValidationError::MissingFormat)
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 2, "initial + 1 retry");
        assert_eq!(state.attempts_made(), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_no_retry() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let (result, state) = retry_with_policy(&fast_policy(5), |_| {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ValidationError::Corrupt {
                    path: "x".into(),
                    detail: "malformed".into(),
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1, "should not retry permanent error");
        assert_eq!(state.attempt(), 0);
    }
}
