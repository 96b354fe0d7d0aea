//! Bounded polling and retry helpers.
//!
//! Every "wait until ready" loop in dblab goes through [`poll_until`]: a fixed
//! poll interval and a hard upper bound, after which the wait fails instead of
//! blocking forever. [`retry_with_backoff`] covers transient failures of a
//! single call (cloud API throttling, flaky SSH connects).

use std::fmt::Display;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, error, warn};

use crate::{Error, Result};

/// Result type for polling check functions.
///
/// - `Ok(Some(value))` - Condition met, return the value
/// - `Ok(None)` - Condition not met yet, keep polling
/// - `Err(e)` - Fatal error, stop polling immediately
pub type PollResult<T> = std::result::Result<Option<T>, String>;

/// Poll `check_fn` every `interval` until it yields a value, fails, or
/// `timeout` elapses.
///
/// The check always runs at least once, so a zero timeout still observes a
/// condition that is already met.
pub fn poll_until<T, F>(
    timeout: Duration,
    interval: Duration,
    description: &str,
    mut check_fn: F,
) -> Result<T>
where
    F: FnMut() -> PollResult<T>,
{
    let start = Instant::now();

    loop {
        match check_fn() {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    return Err(Error::Timeout {
                        description: description.to_string(),
                        seconds: timeout.as_secs(),
                    });
                }
                debug!("Waiting for {}...", description);
                thread::sleep(interval);
            }
            Err(message) => {
                return Err(Error::Poll {
                    description: description.to_string(),
                    message,
                });
            }
        }
    }
}

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(20),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }
}

/// Run `operation` until it succeeds or `config.max_attempts` is exhausted.
///
/// Uses exponential backoff with 0.5x-1.5x jitter between attempts. Only
/// errors for which `is_retryable` returns true are retried.
pub fn retry_with_backoff<T, E, F, R>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: R,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> std::result::Result<T, E>,
    R: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation() {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= config.max_attempts || !is_retryable(&e) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed"
                    );
                    return Err(e);
                }

                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                thread::sleep(jittered_delay);

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast_retry(attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    // ==========================================================================
    // Story: Bounded waits
    // ==========================================================================

    #[test]
    fn when_condition_is_met_poll_returns_value() {
        let calls = Cell::new(0);
        let value = poll_until(
            Duration::from_secs(5),
            Duration::from_millis(1),
            "counter",
            || {
                calls.set(calls.get() + 1);
                if calls.get() == 3 {
                    Ok(Some(calls.get()))
                } else {
                    Ok(None)
                }
            },
        )
        .unwrap();

        assert_eq!(value, 3);
    }

    #[test]
    fn when_condition_never_met_poll_times_out() {
        let result: Result<()> = poll_until(
            Duration::from_millis(20),
            Duration::from_millis(5),
            "never",
            || Ok(None),
        );

        match result {
            Err(Error::Timeout { description, .. }) => assert_eq!(description, "never"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn when_check_fails_poll_stops_immediately() {
        let calls = Cell::new(0);
        let result: Result<()> = poll_until(
            Duration::from_secs(60),
            Duration::from_millis(1),
            "instance running",
            || {
                calls.set(calls.get() + 1);
                Err("instance terminated".to_string())
            },
        );

        assert!(matches!(result, Err(Error::Poll { .. })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn zero_timeout_still_checks_once() {
        let value = poll_until(Duration::ZERO, Duration::from_millis(1), "ready", || {
            Ok(Some("ready"))
        })
        .unwrap();
        assert_eq!(value, "ready");
    }

    // ==========================================================================
    // Story: Retries
    // ==========================================================================

    #[test]
    fn test_succeeds_after_failures() {
        let count = Cell::new(0);
        let result: std::result::Result<i32, String> =
            retry_with_backoff(&fast_retry(5), "op", |_| true, || {
                count.set(count.get() + 1);
                if count.get() < 3 {
                    Err("fail".to_string())
                } else {
                    Ok(42)
                }
            });

        assert_eq!(result, Ok(42));
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn test_exhausts_max_attempts() {
        let count = Cell::new(0);
        let result: std::result::Result<i32, String> =
            retry_with_backoff(&fast_retry(3), "op", |_| true, || {
                count.set(count.get() + 1);
                Err("always fails".to_string())
            });

        assert_eq!(result, Err("always fails".to_string()));
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn test_non_retryable_error_stops_immediately() {
        let count = Cell::new(0);
        let result: std::result::Result<i32, String> =
            retry_with_backoff(&fast_retry(5), "op", |_| false, || {
                count.set(count.get() + 1);
                Err("access denied".to_string())
            });

        assert!(result.is_err());
        assert_eq!(count.get(), 1);
    }
}
