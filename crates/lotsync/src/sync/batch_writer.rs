//! Parallel, idempotent batch upserts for one page.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::progress::{ProgressCallback, SyncProgress, emit};
use crate::entity::listing::Model as ListingModel;
use crate::retry::{RetryConfig, retry_classified};
use crate::store::{ListingStore, StoreError};

/// Splits a page's changed records into batches and upserts them with bounded
/// parallelism.
pub struct BatchWriter<D> {
    store: Arc<D>,
    batch_size: usize,
    concurrency: usize,
    retry: RetryConfig,
    on_progress: Option<Arc<ProgressCallback>>,
}

impl<D: ListingStore + 'static> BatchWriter<D> {
    pub fn new(
        store: Arc<D>,
        batch_size: usize,
        concurrency: usize,
        retry: RetryConfig,
        on_progress: Option<Arc<ProgressCallback>>,
    ) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            concurrency: concurrency.max(1),
            retry,
            on_progress,
        }
    }

    /// Write every record of `page`, returning the number of rows changed.
    ///
    /// All batches are awaited before returning, even when one fails, so a
    /// page is never reported while some of its writes are still running. The
    /// first failure is returned. Dropping the returned future aborts the
    /// batches that have not finished.
    pub async fn write_page(&self, page: u32, records: Vec<ListingModel>) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut batches = JoinSet::new();
        let mut records = records.into_iter().peekable();

        while records.peek().is_some() {
            let batch: Vec<ListingModel> = records.by_ref().take(self.batch_size).collect();
            let store = Arc::clone(&self.store);
            let semaphore = Arc::clone(&semaphore);
            let retry = self.retry.clone();
            let on_progress = self.on_progress.clone();

            batches.spawn(async move {
                let _permit = semaphore.acquire().await.map_err(|_| StoreError::Task {
                    message: "Semaphore closed unexpectedly".to_string(),
                })?;

                let count = batch.len();
                let store = &store;
                let batch = &batch;
                let rows_affected = retry_classified(
                    move || store.upsert_batch(batch.clone()),
                    &retry,
                    |err, delay, attempt| {
                        tracing::debug!(
                            page,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Retrying batch write"
                        );
                    },
                )
                .await?;

                emit(
                    on_progress.as_deref(),
                    SyncProgress::BatchWritten {
                        page,
                        count,
                        rows_affected,
                    },
                );
                Ok::<u64, StoreError>(rows_affected)
            });
        }

        let mut written = 0u64;
        let mut first_error = None;
        while let Some(joined) = batches.join_next().await {
            match joined {
                Ok(Ok(rows)) => written += rows,
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(StoreError::Task {
                        message: e.to_string(),
                    });
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }
}
