//! Bounded retry of collaborator calls
//!
//! Retries an operation with a fixed delay, but only for errors classified
//! as transient. Any other error propagates on the first attempt.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Fixed-delay retry wrapper around a fallible async call
#[derive(Clone, Copy, Debug)]
pub struct RetryingCall<P> {
    tries: u32,
    delay: Duration,
    is_transient: P,
}

impl<P> RetryingCall<P> {
    /// `tries` counts every attempt, including the first one
    pub fn new(tries: u32, delay: Duration, is_transient: P) -> Self {
        Self {
            tries: tries.max(1),
            delay,
            is_transient,
        }
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Invoke `op` until it succeeds, fails with a non-transient error, or the
    /// attempts are exhausted. The last error is returned unmodified.
    pub async fn call<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            debug!("Attempt {}/{}", attempt, self.tries);
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.tries && (self.is_transient)(&e) => {
                    warn!(
                        "Attempt {}/{} failed: {}, retrying in {}s",
                        attempt,
                        self.tries,
                        e,
                        self.delay.as_secs_f64()
                    );
                    sleep(self.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use thiserror::Error;

    #[derive(Debug, Error, PartialEq)]
    enum FlakyError {
        #[error("temporarily unavailable")]
        Unavailable,
        #[error("quota exceeded")]
        Quota,
    }

    fn retry(tries: u32) -> RetryingCall<fn(&FlakyError) -> bool> {
        RetryingCall::new(tries, Duration::from_millis(1), |e: &FlakyError| {
            matches!(e, FlakyError::Unavailable)
        })
    }

    async fn fail_times(calls: &AtomicU32, failures: u32) -> Result<&'static str, FlakyError> {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= failures {
            Err(FlakyError::Unavailable)
        } else {
            Ok("cluster")
        }
    }

    #[tokio::test]
    async fn test_succeeds_within_tries() {
        let calls = AtomicU32::new(0);
        let result = retry(4).call(|| fail_times(&calls, 3)).await;
        assert_eq!(result, Ok("cluster"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_exhausted_tries_return_last_error() {
        let calls = AtomicU32::new(0);
        let result = retry(3).call(|| fail_times(&calls, 3)).await;
        assert_eq!(result, Err(FlakyError::Unavailable));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), FlakyError> = retry(5)
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FlakyError::Quota)
            })
            .await;
        assert_eq!(result, Err(FlakyError::Quota));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_at_least_one_try() {
        assert_eq!(retry(0).tries(), 1);
    }
}
