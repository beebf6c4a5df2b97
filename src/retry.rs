//! Attempt budget and backoff around fallible I/O.

use std::future::Future;
use std::time::Duration;

use crate::config::DEFAULT_BACKOFF;
use crate::error::{Error, Result};

/// How a failed attempt is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Sleep the backoff and try again while attempts remain.
    Retryable,
    /// Abort immediately.
    Fatal,
    /// Device unreachable; never retried.
    NotFound,
}

/// Retries an operation a bounded number of times with a constant backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    retries: u8,
    backoff: Duration,
}

impl RetryPolicy {
    /// Creates a policy that makes `retries + 1` attempts in total.
    #[must_use]
    pub const fn new(retries: u8) -> Self {
        Self {
            retries,
            backoff: DEFAULT_BACKOFF,
        }
    }

    /// Sets the delay between attempts.
    #[must_use]
    pub const fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Total number of attempts this policy makes.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        u32::from(self.retries) + 1
    }

    /// Runs `operation` classifying failures with [`Error::classify`].
    pub async fn run<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_with(operation, Error::classify).await
    }

    /// Runs `operation` with a custom classifier.
    ///
    /// The closure receives the zero-based attempt number. The last error is
    /// returned once the attempt budget is spent.
    pub async fn run_with<T, F, Fut, C>(&self, mut operation: F, classify: C) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&Error) -> Classification,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 0;
        loop {
            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            attempt += 1;
            match classify(&error) {
                Classification::NotFound => {
                    tracing::error!("device not found, no longer in range: {}", error);
                    return Err(error);
                }
                Classification::Fatal => {
                    tracing::error!("fatal error, stopping: {}", error);
                    return Err(error);
                }
                Classification::Retryable if attempt >= max_attempts => {
                    tracing::error!(
                        "communication failed after {} attempt(s), stopping: {}",
                        attempt,
                        error
                    );
                    return Err(error);
                }
                Classification::Retryable => {
                    tracing::debug!(
                        "attempt {} of {} failed: {}",
                        attempt,
                        max_attempts,
                        error
                    );
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_RETRY_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_retryable_uses_full_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let started = tokio::time::Instant::now();

        let result: Result<()> = RetryPolicy::new(3)
            .run(|_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::transport("write failed"))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Transport { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // Three backoffs between four attempts
        assert!(started.elapsed() >= DEFAULT_BACKOFF * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_short_circuits() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = RetryPolicy::new(5)
            .run(|_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::TransportNotFound {
                        address: "AA:BB:CC:DD:EE:FF".into(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(Error::TransportNotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_aborts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = RetryPolicy::new(3)
            .run(|_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::PairingRejected)
                }
            })
            .await;

        assert!(matches!(result, Err(Error::PairingRejected)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_later_attempt() {
        let result = RetryPolicy::new(2)
            .backoff(Duration::from_millis(10))
            .run(|attempt| async move {
                if attempt < 2 {
                    Err(Error::NotConnected)
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_classifier() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = RetryPolicy::new(0)
            .run_with(
                |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(Error::PairingRejected)
                    }
                },
                |_| Classification::Retryable,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
