//! Run coordinator: one invocation of the fetch → detect → write → checkpoint loop.
//!
//! A run moves `idle → running → {completed | failed}`. A single invocation
//! never moves a failed run back to running; that takes a fresh trigger with
//! `resume` set (the watchdog or an operator).
//!
//! The checkpoint is written after every page, so a crash loses at most the
//! pages that were in flight. `current_page` only moves forward: past a page
//! once all its batches are confirmed, or past a page explicitly skipped with
//! a recorded error.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::batch_writer::BatchWriter;
use super::classify::{Classify, ErrorKind};
use super::errors::Result;
use super::fetch::{FetchPool, FetchSettings};
use super::progress::{ProgressCallback, SyncProgress, emit};
use super::run::{SyncRun, YieldReason};
use super::types::{EngineConfig, TriggerRequest, TriggerResponse};
use crate::entity::listing::Model as ListingModel;
use crate::entity::run_status::RunStatus;
use crate::retry::retry_classified;
use crate::store::{ListingStore, ProgressStore, StoreError};
use crate::sync::fingerprint::has_changed;
use crate::upstream::{
    ApiRateLimiter, Page, UpstreamError, UpstreamSource, VehicleListing, to_listing_model,
};

/// How often the shutdown flag is polled while waiting on fetches.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Counts for one applied page.
#[derive(Debug, Default, Clone, Copy)]
struct PageStats {
    fetched: usize,
    decoded: usize,
    malformed: usize,
    unchanged: usize,
    written: u64,
}

/// How applying one page ended.
enum PageOutcome {
    Applied(PageStats),
    /// The working budget ran out before the page was confirmed.
    OutOfTime,
}

enum Step {
    Fetched(u32, std::result::Result<Page, UpstreamError>),
    Interrupted(YieldReason),
}

/// The synchronization engine.
///
/// Cheap to share behind an `Arc`; every invocation of [`trigger`](Self::trigger)
/// works on the run it loads from the progress store, never on in-memory state.
pub struct SyncEngine<S, D> {
    source: Arc<S>,
    store: Arc<D>,
    config: EngineConfig,
    limiter: ApiRateLimiter,
    shutdown: Arc<AtomicBool>,
    on_progress: Option<Arc<ProgressCallback>>,
}

impl<S, D> SyncEngine<S, D>
where
    S: UpstreamSource + 'static,
    D: ListingStore + ProgressStore + 'static,
{
    pub fn new(source: Arc<S>, store: Arc<D>, config: EngineConfig) -> Self {
        let config = config.normalized();
        let limiter = ApiRateLimiter::new(config.rate_per_second, config.burst);
        Self {
            source,
            store,
            config,
            limiter,
            shutdown: Arc::new(AtomicBool::new(false)),
            on_progress: None,
        }
    }

    /// Observe `flag`; once set, the current invocation checkpoints and yields.
    #[must_use]
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    /// Share a limiter with other engines talking to the same upstream.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: ApiRateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<D> {
        &self.store
    }

    pub fn shutdown_flag(&self) -> &Arc<AtomicBool> {
        &self.shutdown
    }

    fn progress(&self) -> Option<&ProgressCallback> {
        self.on_progress.as_deref()
    }

    pub(crate) fn report(&self, event: SyncProgress) {
        emit(self.progress(), event);
    }

    /// Run one invocation.
    ///
    /// Expected failures (unreachable upstream, skipped pages, the error
    /// ceiling) come back as a [`TriggerResponse`]. `Err` means the progress
    /// store could not be read or the run could not be claimed.
    pub async fn trigger(&self, request: TriggerRequest) -> Result<TriggerResponse> {
        let latest = self.store.latest_run().await?;
        let now = Utc::now();

        let mut run = match latest {
            Some(run) if request.resume && self.is_active(&run, now) => {
                info!(
                    run_id = %run.run_id,
                    current_page = run.current_page,
                    "Run already in progress, not starting another"
                );
                let mut response = respond(&run, true, false);
                response.message = Some("run already in progress".to_string());
                return Ok(response);
            }
            Some(run) if request.resume && run.status != RunStatus::Completed => {
                self.prepare_resume(run, &request)
            }
            previous => self.prepare_fresh(previous.as_ref(), &request),
        };

        let resumed = run.revision > 0;
        if !resumed {
            // A new run is recorded as idle before it is claimed.
            if let Some(response) = self.claim_checkpoint(&mut run).await? {
                return Ok(response);
            }
        }

        run.status = RunStatus::Running;
        run.metadata.last_yield_reason = None;
        run.touch();
        if let Some(response) = self.claim_checkpoint(&mut run).await? {
            return Ok(response);
        }

        info!(
            run_id = %run.run_id,
            source = %request.source,
            start_page = run.current_page,
            resumed,
            "Sync run started"
        );
        emit(
            self.progress(),
            SyncProgress::RunStarted {
                run_id: run.run_id,
                source: request.source.clone(),
                start_page: run.current_page,
                resumed,
            },
        );

        Ok(self.drive(&mut run).await)
    }

    /// Save before any page is fetched. A lost compare-and-set means another
    /// writer owns the run.
    async fn claim_checkpoint(&self, run: &mut SyncRun) -> Result<Option<TriggerResponse>> {
        match self.checkpoint(run).await {
            Ok(()) => Ok(None),
            Err(e) if e.is_conflict() => Ok(Some(superseded(run))),
            Err(e) => Err(e.into()),
        }
    }

    /// A run someone is actively advancing right now.
    fn is_active(&self, run: &SyncRun, now: chrono::DateTime<Utc>) -> bool {
        run.status == RunStatus::Running
            && run.metadata.last_yield_reason.is_none()
            && run.idle_for(now) < self.config.stall_threshold()
    }

    fn prepare_resume(&self, mut run: SyncRun, request: &TriggerRequest) -> SyncRun {
        if let Some(page) = request.from_page {
            if page > run.current_page {
                info!(
                    run_id = %run.run_id,
                    from = run.current_page,
                    to = page,
                    "Advancing checkpoint to requested page"
                );
                run.current_page = page;
            } else if page < run.current_page {
                debug!(
                    run_id = %run.run_id,
                    requested = page,
                    checkpoint = run.current_page,
                    "Ignoring start page behind the checkpoint"
                );
            }
        }

        if run.error_count > self.config.max_error_count {
            info!(
                run_id = %run.run_id,
                previous = run.error_count,
                "Resetting error count on resume"
            );
            run.error_count = 0;
        }

        if run.expected_total.is_none() {
            run.expected_total = self.config.expected_total;
        }
        run.resume_count += 1;
        info!(
            run_id = %run.run_id,
            status = %run.status,
            current_page = run.current_page,
            resume_count = run.resume_count,
            requested_by = %request.source,
            "Resuming sync run"
        );
        run
    }

    fn prepare_fresh(&self, previous: Option<&SyncRun>, request: &TriggerRequest) -> SyncRun {
        if let Some(previous) = previous
            && !previous.status.is_terminal()
        {
            info!(
                run_id = %previous.run_id,
                status = %previous.status,
                "Superseding unfinished run with a fresh one"
            );
        }

        let mut run = SyncRun::new(request.source.clone());
        run.current_page = request.from_page.unwrap_or(1).max(1);
        run.expected_total = self.config.expected_total;
        run
    }

    async fn drive(&self, run: &mut SyncRun) -> TriggerResponse {
        let started = Instant::now();
        let deadline = started + self.config.working_budget();
        let mut pages_fetched = 0u32;

        let mut pool = FetchPool::new(
            Arc::clone(&self.source),
            self.limiter.clone(),
            FetchSettings {
                page_size: self.config.page_size,
                concurrency: self.config.fetch_concurrency,
                request_timeout: self.config.request_timeout(),
                retry: self.config.retry_config(),
            },
            self.on_progress.clone(),
            run.current_page,
        );
        let writer = BatchWriter::new(
            Arc::clone(&self.store),
            self.config.batch_size,
            self.config.write_concurrency,
            self.config.retry_config(),
            self.on_progress.clone(),
        );

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                pool.abort();
                return self.yield_run(run, YieldReason::Cancelled, started).await;
            }
            if Instant::now() >= deadline {
                pool.abort();
                return self.yield_run(run, YieldReason::Deadline, started).await;
            }

            let step = tokio::select! {
                biased;
                _ = wait_for_shutdown(&self.shutdown) => Step::Interrupted(YieldReason::Cancelled),
                _ = tokio::time::sleep_until(deadline) => Step::Interrupted(YieldReason::Deadline),
                (page_no, result) = pool.next() => Step::Fetched(page_no, result),
            };

            let (page_no, fetched) = match step {
                Step::Fetched(page_no, fetched) => (page_no, fetched),
                Step::Interrupted(reason) => {
                    pool.abort();
                    return self.yield_run(run, reason, started).await;
                }
            };

            let page = match fetched {
                Ok(page) => page,
                Err(e) if e.is_not_found() && (pages_fetched > 0 || run.records_processed > 0) => {
                    debug!(
                        run_id = %run.run_id,
                        page = page_no,
                        "Upstream returned 404 past the last page, counting it as empty"
                    );
                    Page::empty(page_no)
                }
                Err(e) => {
                    let kind = e.kind();
                    if kind == ErrorKind::Connectivity {
                        pool.abort();
                        return self.fail_run(run, kind, e.to_string(), started).await;
                    }
                    run.error_count += 1;
                    if let Some(response) = self
                        .skip_page(run, page_no, kind, e.to_string(), started)
                        .await
                    {
                        return response;
                    }
                    continue;
                }
            };

            pages_fetched += 1;

            let page_started = Instant::now();
            let stats = match self.apply_page(&writer, run, &page, deadline).await {
                Ok(PageOutcome::Applied(stats)) => stats,
                Ok(PageOutcome::OutOfTime) => {
                    info!(
                        run_id = %run.run_id,
                        page = page_no,
                        "Budget ran out while writing, page left for the next invocation"
                    );
                    pool.abort();
                    return self.yield_run(run, YieldReason::Deadline, started).await;
                }
                Err(e) => {
                    let kind = e.kind();
                    if kind == ErrorKind::Connectivity {
                        pool.abort();
                        return self.fail_run(run, kind, e.to_string(), started).await;
                    }
                    if let Some(response) = self
                        .skip_page(run, page_no, kind, e.to_string(), started)
                        .await
                    {
                        return response;
                    }
                    continue;
                }
            };

            if page.is_empty() {
                run.consecutive_empty_pages += 1;
            } else {
                if run.consecutive_empty_pages > 0 {
                    debug!(
                        run_id = %run.run_id,
                        page = page_no,
                        streak = run.consecutive_empty_pages,
                        "Empty page streak broken"
                    );
                }
                run.consecutive_empty_pages = 0;
            }
            if let Some(total) = page.total {
                run.expected_total = Some(total);
            }
            run.current_page = page_no.saturating_add(1);
            run.records_processed += stats.decoded as u64;
            run.records_written += stats.written;
            run.metadata.records_unchanged += stats.unchanged as u64;
            run.metadata.malformed_records += stats.malformed as u64;
            run.metadata.connectivity_failures = 0;
            run.touch();

            if let Err(e) = self.checkpoint(run).await {
                return store_failure(run, e);
            }

            let elapsed_ms = page_started.elapsed().as_millis() as u64;
            debug!(
                run_id = %run.run_id,
                page = page_no,
                fetched = stats.fetched,
                written = stats.written,
                unchanged = stats.unchanged,
                malformed = stats.malformed,
                elapsed_ms,
                "Page completed"
            );
            emit(
                self.progress(),
                SyncProgress::PageCompleted {
                    page: page_no,
                    fetched: stats.fetched,
                    written: stats.written,
                    unchanged: stats.unchanged,
                    malformed: stats.malformed,
                    records_processed: run.records_processed,
                    elapsed_ms,
                },
            );

            if run.consecutive_empty_pages >= self.config.empty_page_threshold {
                info!(
                    run_id = %run.run_id,
                    streak = run.consecutive_empty_pages,
                    "Empty page threshold reached"
                );
                return self.complete_run(run, started).await;
            }

            if !page.has_more && !page.is_empty() {
                pool.abort();
                return self
                    .yield_run(run, YieldReason::UpstreamExhausted, started)
                    .await;
            }
        }
    }

    /// Decode, fingerprint, and write one page.
    ///
    /// The write is attempted up to `page_write_attempts` times; each failed
    /// attempt counts toward the run's error ceiling. Every attempt must
    /// finish before `deadline`; an attempt still running then is abandoned
    /// and the page is reported as [`PageOutcome::OutOfTime`].
    async fn apply_page(
        &self,
        writer: &BatchWriter<D>,
        run: &mut SyncRun,
        page: &Page,
        deadline: Instant,
    ) -> std::result::Result<PageOutcome, StoreError> {
        let mut stats = PageStats {
            fetched: page.records.len(),
            ..PageStats::default()
        };
        if page.is_empty() {
            return Ok(PageOutcome::Applied(stats));
        }

        let now = Utc::now();
        let mut models: HashMap<String, ListingModel> = HashMap::with_capacity(page.records.len());
        for raw in &page.records {
            match VehicleListing::from_value(raw.clone()) {
                Ok(listing) => {
                    stats.decoded += 1;
                    let model = to_listing_model(listing, now);
                    models.insert(model.external_id.clone(), model);
                }
                Err(e) => {
                    stats.malformed += 1;
                    debug!(page = page.number, error = %e, "Malformed record");
                }
            }
        }
        if stats.malformed > 0 {
            warn!(
                run_id = %run.run_id,
                page = page.number,
                malformed = stats.malformed,
                "Skipped malformed records"
            );
            emit(
                self.progress(),
                SyncProgress::Warning {
                    message: format!(
                        "page {}: skipped {} malformed records",
                        page.number, stats.malformed
                    ),
                },
            );
        }
        if models.is_empty() {
            return Ok(PageOutcome::Applied(stats));
        }

        let ids: Vec<String> = models.keys().cloned().collect();
        let mut attempt = 0;
        loop {
            if Instant::now() >= deadline {
                return Ok(PageOutcome::OutOfTime);
            }
            attempt += 1;
            let write = self.write_changed(writer, page.number, &ids, &models);
            let Ok(result) = tokio::time::timeout_at(deadline, write).await else {
                return Ok(PageOutcome::OutOfTime);
            };
            match result {
                Ok((written, changed)) => {
                    stats.written = written;
                    stats.unchanged = models.len() - changed;
                    return Ok(PageOutcome::Applied(stats));
                }
                Err(e) => {
                    run.error_count += 1;
                    warn!(
                        run_id = %run.run_id,
                        page = page.number,
                        attempt,
                        error_count = run.error_count,
                        error = %e,
                        "Page write failed"
                    );
                    if e.kind() == ErrorKind::Connectivity
                        || attempt >= self.config.page_write_attempts
                    {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Upsert the records whose fingerprint differs from the stored one.
    ///
    /// Returns `(rows written, records submitted)`.
    async fn write_changed(
        &self,
        writer: &BatchWriter<D>,
        page: u32,
        ids: &[String],
        models: &HashMap<String, ListingModel>,
    ) -> std::result::Result<(u64, usize), StoreError> {
        let store = &self.store;
        let existing = retry_classified(
            move || store.fingerprints(ids),
            &self.config.retry_config(),
            |err, delay, attempt| {
                debug!(page, attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying fingerprint lookup");
            },
        )
        .await?;

        let changed: Vec<ListingModel> = models
            .values()
            .filter(|m| {
                has_changed(
                    existing.get(&m.external_id).map(String::as_str),
                    &m.content_fingerprint,
                )
            })
            .cloned()
            .collect();
        let submitted = changed.len();

        let written = writer.write_page(page, changed).await?;
        Ok((written, submitted))
    }

    /// Skip a page after its retries are exhausted. Returns a response when
    /// the run cannot continue.
    async fn skip_page(
        &self,
        run: &mut SyncRun,
        page_no: u32,
        kind: ErrorKind,
        message: String,
        started: Instant,
    ) -> Option<TriggerResponse> {
        warn!(
            run_id = %run.run_id,
            page = page_no,
            kind = %kind,
            error_count = run.error_count,
            error = %message,
            "Skipping page"
        );
        emit(
            self.progress(),
            SyncProgress::PageSkipped {
                page: page_no,
                kind,
                error: message.clone(),
                error_count: run.error_count,
            },
        );

        run.record_error(kind, message);
        run.metadata.record_skipped_page(page_no);
        run.current_page = page_no.saturating_add(1);
        run.touch();

        if run.error_count > self.config.max_error_count {
            let message = format!(
                "error ceiling exceeded ({} errors, limit {})",
                run.error_count, self.config.max_error_count
            );
            return Some(self.fail_run(run, ErrorKind::Fatal, message, started).await);
        }

        match self.checkpoint(run).await {
            Ok(()) => None,
            Err(e) => Some(store_failure(run, e)),
        }
    }

    async fn complete_run(&self, run: &mut SyncRun, started: Instant) -> TriggerResponse {
        let now = Utc::now();
        run.status = RunStatus::Completed;
        run.completed_at = Some(now);
        run.last_activity_at = now;

        if let Err(e) = self.checkpoint(run).await {
            return store_failure(run, e);
        }
        self.finished(run, started);
        respond(run, true, false)
    }

    async fn fail_run(
        &self,
        run: &mut SyncRun,
        kind: ErrorKind,
        message: String,
        started: Instant,
    ) -> TriggerResponse {
        error!(
            run_id = %run.run_id,
            page = run.current_page,
            kind = %kind,
            error = %message,
            "Sync run failed"
        );
        run.status = RunStatus::Failed;
        run.record_error(kind, message.clone());
        if kind == ErrorKind::Connectivity {
            run.metadata.connectivity_failures += 1;
        }
        run.touch();

        if let Err(e) = self.checkpoint(run).await {
            warn!(run_id = %run.run_id, error = %e, "Could not persist failed run");
        }
        self.finished(run, started);

        let mut response = respond(run, false, false);
        response.error = Some(message);
        response.error_kind = Some(kind.as_str().to_string());
        response
    }

    /// Hand control back. Completes instead if the watermark is already met.
    async fn yield_run(
        &self,
        run: &mut SyncRun,
        reason: YieldReason,
        started: Instant,
    ) -> TriggerResponse {
        if run.meets_watermark(self.config.completion_watermark) {
            info!(
                run_id = %run.run_id,
                reason = reason.as_str(),
                fraction = run.fraction_complete().unwrap_or_default(),
                "Completion watermark met"
            );
            return self.complete_run(run, started).await;
        }

        run.metadata.last_yield_reason = Some(reason);
        run.touch();
        if let Err(e) = self.checkpoint(run).await {
            return store_failure(run, e);
        }

        info!(
            run_id = %run.run_id,
            reason = reason.as_str(),
            current_page = run.current_page,
            records_processed = run.records_processed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sync run yielded"
        );
        emit(
            self.progress(),
            SyncProgress::RunYielded {
                run_id: run.run_id,
                reason: reason.as_str().to_string(),
                current_page: run.current_page,
                records_processed: run.records_processed,
            },
        );

        let mut response = respond(run, true, true);
        response.message = Some(reason.as_str().to_string());
        response
    }

    fn finished(&self, run: &SyncRun, started: Instant) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            run_id = %run.run_id,
            status = %run.status,
            records_processed = run.records_processed,
            records_written = run.records_written,
            error_count = run.error_count,
            elapsed_ms,
            "Sync run finished"
        );
        emit(
            self.progress(),
            SyncProgress::RunFinished {
                run_id: run.run_id,
                status: run.status,
                records_processed: run.records_processed,
                records_written: run.records_written,
                elapsed_ms,
            },
        );
    }

    /// Persist `run`, retrying transient store failures.
    async fn checkpoint(&self, run: &mut SyncRun) -> std::result::Result<(), StoreError> {
        let snapshot = &*run;
        let store = &self.store;
        let saved = retry_classified(
            move || {
                let mut candidate = snapshot.clone();
                async move {
                    store.save_progress(&mut candidate).await?;
                    Ok::<SyncRun, StoreError>(candidate)
                }
            },
            &self.config.retry_config(),
            |err, delay, attempt| {
                warn!(
                    run_id = %snapshot.run_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying checkpoint"
                );
            },
        )
        .await?;

        *run = saved;
        Ok(())
    }
}

pub(crate) async fn wait_for_shutdown(flag: &AtomicBool) {
    while !flag.load(Ordering::Relaxed) {
        tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
    }
}

fn respond(run: &SyncRun, success: bool, should_continue: bool) -> TriggerResponse {
    TriggerResponse {
        success,
        status: run.status,
        records_processed: run.records_processed,
        records_written: run.records_written,
        current_page: run.current_page,
        should_continue,
        run_id: Some(run.run_id),
        error: None,
        error_kind: None,
        message: None,
    }
}

fn superseded(run: &SyncRun) -> TriggerResponse {
    warn!(run_id = %run.run_id, "Run was modified by another writer, stopping");
    let mut response = respond(run, false, false);
    response.error = Some("run superseded by another writer".to_string());
    response.error_kind = Some(ErrorKind::Fatal.as_str().to_string());
    response
}

fn store_failure(run: &SyncRun, err: StoreError) -> TriggerResponse {
    if err.is_conflict() {
        return superseded(run);
    }
    error!(run_id = %run.run_id, error = %err, "Could not persist checkpoint");
    let mut response = respond(run, false, false);
    response.error = Some(err.to_string());
    response.error_kind = Some(err.kind().as_str().to_string());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::{FakeSource, MemoryStore};
    use sea_orm::{DbErr, RuntimeErr};
    use std::sync::Mutex;

    fn config() -> EngineConfig {
        EngineConfig {
            page_size: 10,
            fetch_concurrency: 3,
            rate_per_second: 100_000,
            burst: 100_000,
            batch_size: 4,
            write_concurrency: 2,
            empty_page_threshold: 3,
            max_run_duration_secs: 3_600,
            deadline_margin_secs: 0,
            retry_min_delay_ms: 10,
            retry_max_delay_ms: 50,
            max_retries: 2,
            ..EngineConfig::default()
        }
    }

    fn engine(
        source: &Arc<FakeSource>,
        store: &Arc<MemoryStore>,
        config: EngineConfig,
    ) -> SyncEngine<FakeSource, MemoryStore> {
        SyncEngine::new(Arc::clone(source), Arc::clone(store), config)
    }

    #[tokio::test(start_paused = true)]
    async fn completes_when_last_page_meets_expected_total() {
        let source = Arc::new(FakeSource::new(95));
        let store = Arc::new(MemoryStore::default());

        let response = engine(&source, &store, config())
            .trigger(TriggerRequest::fresh("test"))
            .await
            .expect("trigger");

        // Page 10 is short with has_more=false and 95/95 meets the watermark.
        assert!(response.success);
        assert_eq!(response.status, RunStatus::Completed);
        assert!(!response.should_continue);
        assert_eq!(response.records_processed, 95);
        assert_eq!(store.listing_count(), 95);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_upstream_below_watermark_yields_then_completes_on_empty_streak() {
        let source = Arc::new(FakeSource::new(95).without_total());
        let store = Arc::new(MemoryStore::default());
        let config = EngineConfig {
            expected_total: Some(192_800),
            ..config()
        };
        let engine = engine(&source, &store, config);

        let first = engine
            .trigger(TriggerRequest::fresh("test"))
            .await
            .expect("trigger");
        assert!(first.success);
        assert_eq!(first.status, RunStatus::Running);
        assert!(first.should_continue);
        assert_eq!(first.message.as_deref(), Some("upstream_exhausted"));
        assert_eq!(first.current_page, 11);

        // The continuation walks the empty tail; the streak wins over the
        // 95 / 192,800 fraction.
        let second = engine
            .trigger(TriggerRequest::resume("test"))
            .await
            .expect("continue");
        assert_eq!(second.status, RunStatus::Completed);
        assert_eq!(second.run_id, first.run_id);
        assert_eq!(second.records_processed, 95);

        let run = store.run(second.run_id.expect("run id")).expect("stored run");
        assert_eq!(run.consecutive_empty_pages, 3);
        assert!(!run.meets_watermark(0.99));
        assert_eq!(run.resume_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rerun_of_unchanged_data_writes_nothing() {
        let source = Arc::new(FakeSource::new(50));
        let store = Arc::new(MemoryStore::default());
        let engine = engine(&source, &store, config());

        let first = engine
            .trigger(TriggerRequest::fresh("test"))
            .await
            .expect("first");
        assert_eq!(first.records_written, 50);
        let upserts = store.upsert_calls();

        let second = engine
            .trigger(TriggerRequest::fresh("test"))
            .await
            .expect("second");
        assert_eq!(second.status, RunStatus::Completed);
        assert_eq!(second.records_processed, 50);
        assert_eq!(second.records_written, 0);
        assert_eq!(store.upsert_calls(), upserts);
    }

    #[tokio::test(start_paused = true)]
    async fn changed_records_are_rewritten() {
        let source = Arc::new(FakeSource::new(30));
        let store = Arc::new(MemoryStore::default());
        let engine = engine(&source, &store, config());

        engine
            .trigger(TriggerRequest::fresh("test"))
            .await
            .expect("first");
        let before = store.listing("7").expect("listing 7");

        source.bump_revision();
        let second = engine
            .trigger(TriggerRequest::fresh("test"))
            .await
            .expect("second");
        assert_eq!(second.records_written, 30);

        let after = store.listing("7").expect("listing 7");
        assert_ne!(before.content_fingerprint, after.content_fingerprint);
        assert_eq!(before.first_seen_at, after.first_seen_at);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_records_are_counted_and_skipped() {
        let source = Arc::new(FakeSource::new(20));
        source.corrupt_record(3);
        source.corrupt_record(14);
        let store = Arc::new(MemoryStore::default());

        let response = engine(&source, &store, config())
            .trigger(TriggerRequest::fresh("test"))
            .await
            .expect("trigger");

        let run = store.run(response.run_id.expect("id")).expect("run");
        assert_eq!(run.metadata.malformed_records, 2);
        assert_eq!(run.records_processed, 18);
        assert_eq!(store.listing_count(), 18);
        assert_eq!(run.error_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transient_fetch_skips_page_and_continues() {
        let source = Arc::new(FakeSource::new(50));
        source.fail_page(2, 10, || UpstreamError::Server {
            status: 502,
            message: "bad gateway".into(),
        });
        let store = Arc::new(MemoryStore::default());

        let response = engine(&source, &store, config())
            .trigger(TriggerRequest::fresh("test"))
            .await
            .expect("trigger");

        let run = store.run(response.run_id.expect("id")).expect("run");
        assert_eq!(run.error_count, 1);
        assert_eq!(run.metadata.skipped_pages, vec![2]);
        assert_eq!(run.last_error_kind.as_deref(), Some("transient"));
        assert_eq!(run.records_processed, 40);
        assert!(store.listing("15").is_none());
        assert!(store.listing("25").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn connectivity_failure_stops_the_run() {
        let source = Arc::new(FakeSource::new(50));
        source.fail_page(3, 1, || UpstreamError::Unreachable {
            message: "connection refused".into(),
        });
        let store = Arc::new(MemoryStore::default());

        let response = engine(&source, &store, config())
            .trigger(TriggerRequest::fresh("test"))
            .await
            .expect("trigger");

        assert!(!response.success);
        assert_eq!(response.status, RunStatus::Failed);
        assert_eq!(response.error_kind.as_deref(), Some("connectivity"));
        assert_eq!(response.current_page, 3);

        let run = store.run(response.run_id.expect("id")).expect("run");
        assert_eq!(run.metadata.connectivity_failures, 1);
        assert!(run.is_connectivity_failure());
        assert_eq!(source.fetch_count(3), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_before_any_page_is_a_connectivity_failure() {
        let source = Arc::new(FakeSource::new(0).not_found_past_end());
        let store = Arc::new(MemoryStore::default());

        let response = engine(&source, &store, config())
            .trigger(TriggerRequest::fresh("test"))
            .await
            .expect("trigger");

        assert_eq!(response.status, RunStatus::Failed);
        assert_eq!(response.error_kind.as_deref(), Some("connectivity"));
        assert_eq!(response.current_page, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_past_the_last_page_counts_as_empty() {
        let source = Arc::new(FakeSource::new(45).without_total().not_found_past_end());
        let store = Arc::new(MemoryStore::default());

        let response = engine(&source, &store, config())
            .trigger(TriggerRequest::fresh("test"))
            .await
            .expect("trigger");

        assert!(response.success);
        assert_eq!(response.status, RunStatus::Completed);
        assert_eq!(response.records_processed, 45);
        // Pages 6, 7 and 8 make up the empty streak.
        assert_eq!(response.current_page, 9);

        let run = store.run(response.run_id.expect("id")).expect("run");
        assert_eq!(run.error_count, 0);
        assert_eq!(run.metadata.connectivity_failures, 0);
        assert!(run.last_error_kind.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn error_ceiling_fails_the_run() {
        let source = Arc::new(FakeSource::new(100));
        for page in 1..=4 {
            source.fail_page(page, 10, || UpstreamError::decode("garbage"));
        }
        let store = Arc::new(MemoryStore::default());
        let config = EngineConfig {
            max_error_count: 2,
            ..config()
        };

        let response = engine(&source, &store, config)
            .trigger(TriggerRequest::fresh("test"))
            .await
            .expect("trigger");

        assert_eq!(response.status, RunStatus::Failed);
        assert_eq!(response.error_kind.as_deref(), Some("fatal"));
        assert_eq!(response.current_page, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_page_write_is_retried_then_skipped() {
        let source = Arc::new(FakeSource::new(10));
        let store = Arc::new(MemoryStore::default());
        store.fail_upserts(3, || {
            StoreError::Database(DbErr::Exec(RuntimeErr::Internal(
                "UNIQUE constraint failed".into(),
            )))
        });
        let config = EngineConfig {
            page_size: 10,
            batch_size: 10,
            page_write_attempts: 3,
            ..config()
        };

        let response = engine(&source, &store, config)
            .trigger(TriggerRequest::fresh("test"))
            .await
            .expect("trigger");

        let run = store.run(response.run_id.expect("id")).expect("run");
        assert_eq!(run.error_count, 3);
        assert_eq!(run.metadata.skipped_pages, vec![1]);
        assert_eq!(run.last_error_kind.as_deref(), Some("data"));
        assert_eq!(store.listing_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_checkpoints_and_resume_continues_from_it() {
        let source = Arc::new(FakeSource::new(200));
        let store = Arc::new(MemoryStore::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let engine = engine(&source, &store, config())
            .with_shutdown_flag(Arc::clone(&shutdown))
            .with_progress(Box::new(move |event| {
                if let SyncProgress::PageCompleted { page: 5, .. } = event {
                    flag.store(true, Ordering::SeqCst);
                }
            }));

        let first = engine
            .trigger(TriggerRequest::fresh("test"))
            .await
            .expect("first");
        assert_eq!(first.status, RunStatus::Running);
        assert!(first.should_continue);
        assert_eq!(first.message.as_deref(), Some("cancelled"));
        assert_eq!(first.current_page, 6);
        assert_eq!(first.records_processed, 50);

        shutdown.store(false, Ordering::SeqCst);
        let second = engine
            .trigger(TriggerRequest {
                from_page: Some(1),
                ..TriggerRequest::resume("test")
            })
            .await
            .expect("second");
        assert_eq!(second.run_id, first.run_id);
        assert_eq!(second.status, RunStatus::Completed);
        assert_eq!(second.records_processed, 200);
        assert_eq!(source.fetch_count(1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn checkpoint_is_monotonic_across_snapshots() {
        let source = Arc::new(FakeSource::new(120));
        source.fail_page(4, 10, || UpstreamError::Timeout {
            after: Duration::from_secs(30),
        });
        let store = Arc::new(MemoryStore::default());

        engine(&source, &store, config())
            .trigger(TriggerRequest::fresh("test"))
            .await
            .expect("trigger");

        let history = store.history();
        assert!(history.len() > 10);
        for pair in history.windows(2) {
            assert!(pair[1].current_page >= pair[0].current_page);
            assert!(pair[1].records_processed >= pair[0].records_processed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_yields_with_checkpoint() {
        let source = Arc::new(FakeSource::new(10_000).without_total());
        source.set_latency(Duration::from_secs(2));
        let store = Arc::new(MemoryStore::default());
        let config = EngineConfig {
            fetch_concurrency: 1,
            max_run_duration_secs: 9,
            ..config()
        };

        let response = engine(&source, &store, config)
            .trigger(TriggerRequest::fresh("test"))
            .await
            .expect("trigger");

        assert_eq!(response.status, RunStatus::Running);
        assert!(response.should_continue);
        assert_eq!(response.message.as_deref(), Some("deadline"));
        assert!(response.current_page > 1);
        assert!(response.current_page < 10);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_page_write_yields_before_the_budget_runs_out() {
        let source = Arc::new(FakeSource::new(40).without_total());
        let store = Arc::new(MemoryStore::default());
        store.fail_upserts(1_000, || {
            StoreError::Database(DbErr::Exec(RuntimeErr::Internal(
                "database is locked".into(),
            )))
        });
        let config = EngineConfig {
            max_run_duration_secs: 5,
            deadline_margin_secs: 1,
            retry_min_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            max_retries: 4,
            page_write_attempts: 3,
            ..config()
        };

        let started = Instant::now();
        let response = engine(&source, &store, config)
            .trigger(TriggerRequest::fresh("test"))
            .await
            .expect("trigger");
        let elapsed = started.elapsed();

        assert!(
            elapsed <= Duration::from_secs(5),
            "invocation overran its 5s budget: {elapsed:?}"
        );
        assert_eq!(response.status, RunStatus::Running);
        assert!(response.should_continue);
        assert_eq!(response.message.as_deref(), Some("deadline"));
        // The unconfirmed page is fetched again by the next invocation.
        assert_eq!(response.current_page, 1);
        assert_eq!(store.listing_count(), 0);

        let run = store.run(response.run_id.expect("id")).expect("run");
        assert_eq!(run.current_page, 1);
        assert_eq!(run.metadata.last_yield_reason, Some(YieldReason::Deadline));
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_run_is_recorded_idle_before_it_starts() {
        let source = Arc::new(FakeSource::new(20));
        let store = Arc::new(MemoryStore::default());

        let response = engine(&source, &store, config())
            .trigger(TriggerRequest::fresh("test"))
            .await
            .expect("trigger");

        let history = store.history();
        assert_eq!(history[0].status, RunStatus::Idle);
        assert_eq!(history[0].revision, 1);
        assert_eq!(history[1].status, RunStatus::Running);
        assert_eq!(history[1].run_id, history[0].run_id);
        assert_eq!(response.run_id, Some(history[0].run_id));
    }

    #[tokio::test(start_paused = true)]
    async fn soft_completion_on_deadline_when_watermark_met() {
        let source = Arc::new(FakeSource::new(10_000).without_total());
        source.set_latency(Duration::from_secs(1));
        let store = Arc::new(MemoryStore::default());
        let config = EngineConfig {
            fetch_concurrency: 1,
            max_run_duration_secs: 5,
            expected_total: Some(30),
            ..config()
        };

        let response = engine(&source, &store, config)
            .trigger(TriggerRequest::fresh("test"))
            .await
            .expect("trigger");
        assert_eq!(response.status, RunStatus::Completed);
        assert!(response.records_processed >= 30);
    }

    #[tokio::test(start_paused = true)]
    async fn active_run_is_not_started_twice() {
        let source = Arc::new(FakeSource::new(10));
        let store = Arc::new(MemoryStore::default());
        let mut run = SyncRun::new("other");
        run.status = RunStatus::Running;
        run.current_page = 40;
        run.revision = 2;
        store.put_run(run.clone());

        let response = engine(&source, &store, config())
            .trigger(TriggerRequest::resume("test"))
            .await
            .expect("trigger");

        assert!(response.success);
        assert!(!response.should_continue);
        assert_eq!(response.run_id, Some(run.run_id));
        assert_eq!(response.message.as_deref(), Some("run already in progress"));
        assert_eq!(source.fetch_count(40), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_restarts_from_checkpoint_and_resets_error_ceiling() {
        let source = Arc::new(FakeSource::new(100));
        let store = Arc::new(MemoryStore::default());
        let mut run = SyncRun::new("other");
        run.status = RunStatus::Failed;
        run.current_page = 8;
        run.records_processed = 70;
        run.error_count = 99;
        run.revision = 5;
        store.put_run(run.clone());

        let response = engine(&source, &store, config())
            .trigger(TriggerRequest::resume("watchdog"))
            .await
            .expect("trigger");

        assert_eq!(response.run_id, Some(run.run_id));
        assert_eq!(response.status, RunStatus::Completed);
        assert_eq!(response.records_processed, 100);
        assert_eq!(source.fetch_count(1), 0);
        let stored = store.run(run.run_id).expect("run");
        assert_eq!(stored.resume_count, 1);
        assert_eq!(stored.error_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_writer_supersedes_the_run() {
        let source = Arc::new(FakeSource::new(100).without_total());
        let store = Arc::new(MemoryStore::default());
        let hijack_store = Arc::clone(&store);
        let seen = Arc::new(Mutex::new(None));
        let seen_capture = Arc::clone(&seen);

        let engine = engine(&source, &store, config()).with_progress(Box::new(move |event| {
            match event {
                SyncProgress::RunStarted { run_id, .. } => {
                    *seen_capture.lock().unwrap_or_else(|e| e.into_inner()) = Some(run_id);
                }
                SyncProgress::PageCompleted { page: 2, .. } => {
                    let run_id = *seen_capture.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(mut run) = run_id.and_then(|id| hijack_store.run(id)) {
                        run.revision += 10;
                        hijack_store.put_run(run);
                    }
                }
                _ => {}
            }
        }));

        let response = engine
            .trigger(TriggerRequest::fresh("test"))
            .await
            .expect("trigger");
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("run superseded by another writer"));
        assert_eq!(response.current_page, 4);
    }
}
