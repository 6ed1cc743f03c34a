use std::{future::Future, time::Duration};

/// How many times, and how far apart, a fallible network operation is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Attempt exactly once.
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1))
    }
}

/// Runs `operation` until it succeeds or `max_attempts` attempts have failed, sleeping `delay`
/// between attempts. The attempt number, starting at 1, is passed to the operation.
///
/// Yields the error of the last attempt if all attempts fail.
pub async fn async_retry_n<O, R, E, F>(
    max_attempts: usize,
    delay: Duration,
    operation: O,
) -> Result<R, E>
where
    F: Future<Output = Result<R, E>>,
    O: Fn(usize) -> F,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= max_attempts {
                    return Err(e);
                }
                tracing::debug!(attempt, max_attempts, error=%e, "attempt failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

pub async fn async_retry_with<O, R, E, F>(policy: RetryPolicy, operation: O) -> Result<R, E>
where
    F: Future<Output = Result<R, E>>,
    O: Fn(usize) -> F,
    E: std::fmt::Display,
{
    async_retry_n(policy.max_attempts.max(1), policy.delay, operation).await
}

#[cfg(test)]
mod test {
    use super::{async_retry_n, async_retry_with, RetryPolicy};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn completes_successfully_first_time() {
        let value: Result<&str, &str> =
            async_retry_n(2, Duration::from_nanos(1), |attempt| async move {
                assert_eq!(attempt, 1);
                Ok("success")
            })
            .await;

        assert_eq!(value, Ok("success"));
    }

    #[tokio::test]
    async fn completes_successfully_second_time() {
        let value: Result<&str, &str> =
            async_retry_n(2, Duration::from_nanos(1), |attempt| async move {
                match attempt {
                    1 => Err("forced retry"),
                    2 => Ok("success"),
                    _ => panic!("too many retry attempts"),
                }
            })
            .await;

        assert_eq!(value, Ok("success"));
    }

    #[tokio::test]
    async fn errors_after_retries_exhausted() {
        let value: Result<&str, &str> =
            async_retry_n(2, Duration::from_nanos(1), |attempt| async move {
                match attempt {
                    1 => Err("forced retry 1"),
                    2 => Err("forced retry 2"),
                    _ => panic!("too many retry attempts"),
                }
            })
            .await;

        assert_eq!(value, Err("forced retry 2"));
    }

    #[tokio::test]
    async fn zero_attempt_policy_still_attempts_once() {
        let attempts = AtomicUsize::new(0);
        let value: Result<(), &str> =
            async_retry_with(RetryPolicy::new(0, Duration::ZERO), |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err("nope") }
            })
            .await;

        assert_eq!(value, Err("nope"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
