//! Bounded pool of page fetch workers.
//!
//! The pool keeps up to `concurrency` successive pages in flight and hands
//! results back strictly in page order. Every attempt, retries included,
//! takes a rate-limiter token and runs under the per-request timeout. Only
//! transient failures are retried here; anything else surfaces immediately so
//! the coordinator can decide.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};

use super::progress::{ProgressCallback, SyncProgress, emit};
use crate::retry::{RetryConfig, retry_classified};
use crate::upstream::{ApiRateLimiter, Page, UpstreamError, UpstreamSource};

/// Static settings for a [`FetchPool`].
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub page_size: u32,
    pub concurrency: usize,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

/// In-order prefetching page fetcher.
///
/// Dropping the pool aborts every outstanding fetch.
pub struct FetchPool<S> {
    source: Arc<S>,
    limiter: ApiRateLimiter,
    settings: FetchSettings,
    on_progress: Option<Arc<ProgressCallback>>,
    next_page: u32,
    in_flight: VecDeque<(u32, JoinHandle<Result<Page, UpstreamError>>)>,
}

impl<S: UpstreamSource + 'static> FetchPool<S> {
    pub fn new(
        source: Arc<S>,
        limiter: ApiRateLimiter,
        settings: FetchSettings,
        on_progress: Option<Arc<ProgressCallback>>,
        start_page: u32,
    ) -> Self {
        let mut pool = Self {
            source,
            limiter,
            settings,
            on_progress,
            next_page: start_page.max(1),
            in_flight: VecDeque::new(),
        };
        pool.fill();
        pool
    }

    /// Number of fetches currently outstanding.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn fill(&mut self) {
        while self.in_flight.len() < self.settings.concurrency.max(1) {
            let page = self.next_page;
            self.next_page = self.next_page.saturating_add(1);

            let handle = tokio::spawn(fetch_page_with_retry(
                Arc::clone(&self.source),
                self.limiter.clone(),
                self.settings.clone(),
                self.on_progress.clone(),
                page,
            ));
            self.in_flight.push_back((page, handle));
        }
    }

    /// Wait for the lowest outstanding page.
    ///
    /// Cancel-safe: if the returned future is dropped before completing, the
    /// page stays queued and the next call picks it up again.
    pub async fn next(&mut self) -> (u32, Result<Page, UpstreamError>) {
        if self.in_flight.is_empty() {
            self.fill();
        }
        let Some((page, handle)) = self.in_flight.front_mut() else {
            return (
                self.next_page,
                Err(UpstreamError::Worker {
                    message: "fetch pool has no workers".to_string(),
                }),
            );
        };
        let page = *page;
        let result = handle.await;

        self.in_flight.pop_front();
        self.fill();
        (page, result.unwrap_or_else(|e| Err(worker_error(page, e))))
    }

    /// Abort every outstanding fetch.
    pub fn abort(&mut self) {
        for (_, handle) in self.in_flight.drain(..) {
            handle.abort();
        }
    }
}

impl<S> Drop for FetchPool<S> {
    fn drop(&mut self) {
        for (_, handle) in self.in_flight.drain(..) {
            handle.abort();
        }
    }
}

fn worker_error(page: u32, err: JoinError) -> UpstreamError {
    let message = if err.is_panic() {
        let payload = err.into_panic();
        if let Some(s) = payload.downcast_ref::<&str>() {
            format!("page {page} fetch panicked: {s}")
        } else if let Some(s) = payload.downcast_ref::<String>() {
            format!("page {page} fetch panicked: {s}")
        } else {
            format!("page {page} fetch panicked")
        }
    } else {
        format!("page {page} fetch was cancelled")
    };
    UpstreamError::Worker { message }
}

async fn fetch_page_with_retry<S: UpstreamSource>(
    source: Arc<S>,
    limiter: ApiRateLimiter,
    settings: FetchSettings,
    on_progress: Option<Arc<ProgressCallback>>,
    page: u32,
) -> Result<Page, UpstreamError> {
    let source = &source;
    let limiter = &limiter;
    let page_size = settings.page_size;
    let timeout = settings.request_timeout;

    retry_classified(
        move || async move {
            limiter.acquire().await;
            match tokio::time::timeout(timeout, source.fetch_page(page, page_size)).await {
                Ok(result) => result,
                Err(_) => Err(UpstreamError::Timeout { after: timeout }),
            }
        },
        &settings.retry,
        |err, delay, attempt| {
            tracing::debug!(
                page,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying page fetch"
            );
            emit(
                on_progress.as_deref(),
                SyncProgress::PageFetchRetry {
                    page,
                    retry_after_ms: delay.as_millis() as u64,
                    attempt,
                    error: err.to_string(),
                },
            );
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::FakeSource;
    use std::sync::Mutex;

    fn settings(concurrency: usize) -> FetchSettings {
        FetchSettings {
            page_size: 10,
            concurrency,
            request_timeout: Duration::from_secs(5),
            retry: RetryConfig::new(Duration::from_millis(10), Duration::from_millis(100), 3),
        }
    }

    fn limiter() -> ApiRateLimiter {
        ApiRateLimiter::new(10_000, 10_000)
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_pages_in_order() {
        let source = Arc::new(FakeSource::new(95));
        let mut pool = FetchPool::new(source, limiter(), settings(4), None, 3);
        assert_eq!(pool.in_flight(), 4);

        for expected in 3..=11 {
            let (page, result) = pool.next().await;
            assert_eq!(page, expected);
            let page = result.expect("fetch");
            assert_eq!(page.number, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_and_reports_them() {
        let source = Arc::new(FakeSource::new(30));
        source.fail_page(2, 2, || UpstreamError::Server {
            status: 503,
            message: "busy".into(),
        });

        let events: Arc<Mutex<Vec<SyncProgress>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&events);
        let callback: ProgressCallback = Box::new(move |event| {
            captured
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(event);
        });

        let mut pool = FetchPool::new(
            Arc::clone(&source),
            limiter(),
            settings(2),
            Some(Arc::new(callback)),
            1,
        );
        let _ = pool.next().await;
        let (page, result) = pool.next().await;
        assert_eq!(page, 2);
        assert_eq!(result.expect("recovered").records.len(), 10);
        assert_eq!(source.fetch_count(2), 3);

        let events = events.lock().unwrap_or_else(|e| e.into_inner());
        let retries = events
            .iter()
            .filter(|e| matches!(e, SyncProgress::PageFetchRetry { page: 2, .. }))
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_retry_connectivity_failures() {
        let source = Arc::new(FakeSource::new(30));
        source.fail_page(1, 1, || UpstreamError::Unreachable {
            message: "dns".into(),
        });

        let mut pool = FetchPool::new(Arc::clone(&source), limiter(), settings(1), None, 1);
        let (_, result) = pool.next().await;
        assert!(matches!(result, Err(UpstreamError::Unreachable { .. })));
        assert_eq!(source.fetch_count(1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetches_time_out_as_transient() {
        let source = Arc::new(FakeSource::new(30));
        source.set_latency(Duration::from_secs(60));

        let mut pool = FetchPool::new(
            Arc::clone(&source),
            limiter(),
            FetchSettings {
                request_timeout: Duration::from_secs(1),
                retry: RetryConfig::new(Duration::from_millis(10), Duration::from_millis(10), 1),
                ..settings(1)
            },
            None,
            1,
        );
        let (_, result) = pool.next().await;
        assert!(matches!(result, Err(UpstreamError::Timeout { .. })));
        assert_eq!(source.fetch_count(1), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_pool_aborts_outstanding_fetches() {
        let source = Arc::new(FakeSource::new(1_000));
        source.set_latency(Duration::from_secs(10));
        let pool = FetchPool::new(Arc::clone(&source), limiter(), settings(3), None, 1);
        tokio::task::yield_now().await;
        drop(pool);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.completed_fetches(), 0);
    }
}
