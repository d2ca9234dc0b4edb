//! Shared retry policy for page fetches and batch writes.
//!
//! One [`RetryConfig`] drives every retry in the engine. Whether an error is
//! retried at all is decided by its [`ErrorKind`](crate::sync::ErrorKind):
//! only transient failures are retried locally.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::sync::{Classify, DEFAULT_MAX_RETRIES, INITIAL_BACKOFF_MS, MAX_BACKOFF_MS};

/// Configuration for retry operations.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Minimum delay between retries.
    pub min_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Maximum number of retry attempts.
    pub max_retries: usize,
    /// Whether to add jitter to delays.
    pub with_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_delay: Duration::from_millis(MAX_BACKOFF_MS),
            max_retries: DEFAULT_MAX_RETRIES as usize,
            with_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with custom values.
    #[must_use]
    pub fn new(min_delay: Duration, max_delay: Duration, max_retries: usize) -> Self {
        Self {
            min_delay,
            max_delay,
            max_retries,
            with_jitter: true,
        }
    }

    /// Set whether to use jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.with_jitter = jitter;
        self
    }

    /// Build an exponential backoff strategy from this configuration.
    #[must_use]
    pub fn into_backoff(self) -> ExponentialBuilder {
        let mut builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries);

        if self.with_jitter {
            builder = builder.with_jitter();
        }

        builder
    }
}

/// Run `operation`, retrying transient failures with exponential backoff.
///
/// `on_retry` is called before each backoff sleep with the error, the delay,
/// and the 1-based number of the attempt that just failed. Non-transient
/// errors and the error from the final attempt are returned as-is.
///
/// # Example
///
/// ```ignore
/// use lotsync::retry::{RetryConfig, retry_classified};
///
/// let page = retry_classified(
///     || source.fetch_page(7, 100),
///     &RetryConfig::default(),
///     |err, delay, attempt| tracing::debug!(%err, ?delay, attempt, "retrying"),
/// )
/// .await?;
/// ```
pub async fn retry_classified<T, E, F, Fut, N>(
    mut operation: F,
    config: &RetryConfig,
    mut on_retry: N,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify,
    N: FnMut(&E, Duration, u32),
{
    let attempt = AtomicU32::new(0);

    let retry_op = || {
        attempt.fetch_add(1, Ordering::SeqCst);
        operation()
    };

    retry_op
        .retry(config.clone().into_backoff())
        .notify(|err, dur| on_retry(err, dur, attempt.load(Ordering::SeqCst)))
        .when(|err| err.kind().is_retryable())
        .await
}
