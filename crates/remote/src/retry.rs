//! Retry with exponential backoff for remote tier operations

use crate::config::RetryConfig;
use crate::error::{RemoteError, Result};
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder, backoff::Backoff};
use kiln_core::CancelToken;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry a fallible operation with exponential backoff
///
/// Transient errors are retried up to `config.max_attempts`; a
/// non-retryable error fails immediately. The cancellation token is
/// checked before every attempt so long retry loops stay interruptible.
///
/// # Errors
///
/// Returns the operation's error when it is not retryable, a
/// [`RemoteError::RetryExhausted`] once the attempt budget is spent, or
/// [`RemoteError::Cancelled`] when the token fires.
pub fn retry_with_backoff<T, F>(
    config: &RetryConfig,
    cancel: &CancelToken,
    operation_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut backoff = create_backoff(config);
    let mut attempts = 0;

    loop {
        cancel.check()?;
        attempts += 1;

        match f() {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if matches!(err, RemoteError::Cancelled(_)) {
                    return Err(err);
                }

                if attempts >= config.max_attempts {
                    warn!(
                        operation = operation_name,
                        attempts,
                        error = %err,
                        "operation failed after maximum retries"
                    );
                    return Err(RemoteError::retry_exhausted(
                        operation_name,
                        attempts,
                        err.to_string(),
                    ));
                }

                if !is_retryable(&err) {
                    debug!(
                        operation = operation_name,
                        error = %err,
                        "error is not retryable, failing immediately"
                    );
                    return Err(err);
                }

                if let Some(duration) = backoff.next_backoff() {
                    warn!(
                        operation = operation_name,
                        attempts,
                        error = %err,
                        retry_in_ms = duration.as_millis(),
                        "operation failed, retrying"
                    );
                    std::thread::sleep(duration);
                } else {
                    return Err(RemoteError::retry_exhausted(
                        operation_name,
                        attempts,
                        err.to_string(),
                    ));
                }
            }
        }
    }
}

/// Create exponential backoff from config
fn create_backoff(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(config.initial_backoff_ms))
        .with_max_interval(Duration::from_millis(config.max_backoff_ms))
        .with_multiplier(config.backoff_multiplier)
        .with_max_elapsed_time(None) // We use max_attempts instead
        .build()
}

/// Determine if an error is retryable
fn is_retryable(err: &RemoteError) -> bool {
    match err {
        // Network/connection errors are retryable
        RemoteError::ConnectionFailed { .. } => true,

        // Timeouts are retryable
        RemoteError::Timeout { .. } => true,

        // Server-side trouble and throttling are retryable
        RemoteError::Status { status, .. } => *status == 429 || *status >= 500,

        // I/O errors are retryable
        RemoteError::Io { .. } => true,

        // These errors are NOT retryable
        RemoteError::Auth { .. } => false,
        RemoteError::NotFound { .. } => false,
        RemoteError::InvalidMetadata { .. } => false,
        RemoteError::Configuration { .. } => false,
        RemoteError::Serialization { .. } => false,
        RemoteError::RetryExhausted { .. } => false,
        RemoteError::Cancelled(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick_config(max_attempts: usize) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_retry_success_first_attempt() {
        let config = RetryConfig::default();
        let cancel = CancelToken::new();
        let call_count = AtomicUsize::new(0);

        let result = retry_with_backoff(&config, &cancel, "test", || {
            call_count.fetch_add(1, Ordering::SeqCst);
            Ok::<_, RemoteError>(42)
        });

        assert_eq!(result.unwrap(), 42);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_success_after_failure() {
        let config = quick_config(3);
        let cancel = CancelToken::new();
        let call_count = AtomicUsize::new(0);

        let result = retry_with_backoff(&config, &cancel, "test", || {
            let count = call_count.fetch_add(1, Ordering::SeqCst) + 1;
            if count < 3 {
                Err(RemoteError::timeout("test", 1))
            } else {
                Ok::<_, RemoteError>(42)
            }
        });

        assert_eq!(result.unwrap(), 42);
        assert_eq!(call_count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_exhausted() {
        let config = quick_config(2);
        let cancel = CancelToken::new();
        let call_count = AtomicUsize::new(0);

        let result = retry_with_backoff(&config, &cancel, "test", || {
            call_count.fetch_add(1, Ordering::SeqCst);
            Err::<i32, _>(RemoteError::timeout("test", 1))
        });

        assert_eq!(call_count.load(Ordering::SeqCst), 2);
        assert!(matches!(
            result.unwrap_err(),
            RemoteError::RetryExhausted { attempts: 2, .. }
        ));
    }

    #[test]
    fn test_non_retryable_error_fails_immediately() {
        let config = RetryConfig::default();
        let cancel = CancelToken::new();
        let call_count = AtomicUsize::new(0);

        let result = retry_with_backoff(&config, &cancel, "test", || {
            call_count.fetch_add(1, Ordering::SeqCst);
            Err::<i32, _>(RemoteError::invalid_metadata("u1", "bad json"))
        });

        assert!(matches!(
            result.unwrap_err(),
            RemoteError::InvalidMetadata { .. }
        ));
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelled_token_stops_before_first_attempt() {
        let config = RetryConfig::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let call_count = AtomicUsize::new(0);

        let result = retry_with_backoff(&config, &cancel, "test", || {
            call_count.fetch_add(1, Ordering::SeqCst);
            Ok::<_, RemoteError>(42)
        });

        assert!(matches!(result.unwrap_err(), RemoteError::Cancelled(_)));
        assert_eq!(call_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancellation_raised_by_operation_is_not_wrapped() {
        let config = quick_config(1);
        let cancel = CancelToken::new();

        // Even at the attempt budget, a cancellation must never be
        // reported as retry exhaustion.
        let result = retry_with_backoff(&config, &cancel, "test", || {
            Err::<i32, _>(RemoteError::Cancelled(kiln_core::Cancelled))
        });

        assert!(matches!(result.unwrap_err(), RemoteError::Cancelled(_)));
    }

    #[test]
    fn test_retryable_status_codes() {
        assert!(is_retryable(&RemoteError::status("op", 429)));
        assert!(is_retryable(&RemoteError::status("op", 500)));
        assert!(is_retryable(&RemoteError::status("op", 503)));
        assert!(!is_retryable(&RemoteError::status("op", 400)));
        assert!(!is_retryable(&RemoteError::status("op", 418)));
        assert!(!is_retryable(&RemoteError::auth("denied")));
        assert!(!is_retryable(&RemoteError::not_found("u1")));
    }
}
