//! In-memory fakes for engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entity::listing::Model as ListingModel;
use crate::entity::run_status::RunStatus;
use crate::store::{ListingStore, ProgressStore, Result as StoreResult, StoreError};
use crate::sync::SyncRun;
use crate::upstream::{Page, Result as UpstreamResult, UpstreamError, UpstreamSource};

type ErrorFactory<E> = Box<dyn Fn() -> E + Send + Sync>;

/// A listing model with the given id and fingerprint.
pub fn listing_model(external_id: &str, fingerprint: &str) -> ListingModel {
    let now = Utc::now().fixed_offset();
    ListingModel {
        external_id: external_id.to_string(),
        title: format!("Listing {external_id}"),
        make: None,
        model_name: None,
        year: None,
        vin: None,
        price_cents: None,
        currency: None,
        mileage: None,
        status: None,
        location: None,
        images: serde_json::json!([]),
        auction_ends_at: None,
        attributes: serde_json::json!({}),
        content_fingerprint: fingerprint.to_string(),
        first_seen_at: now,
        last_synced_at: now,
    }
}

/// Upstream with `total` records laid out over pages of the requested size.
pub struct FakeSource {
    total: AtomicU64,
    report_total: bool,
    /// Answer 404 for pages past the data and always claim more pages.
    not_found_past_end: bool,
    /// Bumping this changes the price of every record.
    revision: AtomicU64,
    latency: Mutex<Option<Duration>>,
    failures: Mutex<HashMap<u32, (usize, ErrorFactory<UpstreamError>)>>,
    malformed: Mutex<Vec<u32>>,
    calls: Mutex<HashMap<u32, usize>>,
    completed: AtomicUsize,
}

impl FakeSource {
    pub fn new(total: u64) -> Self {
        Self {
            total: AtomicU64::new(total),
            report_total: true,
            not_found_past_end: false,
            revision: AtomicU64::new(0),
            latency: Mutex::new(None),
            failures: Mutex::new(HashMap::new()),
            malformed: Mutex::new(Vec::new()),
            calls: Mutex::new(HashMap::new()),
            completed: AtomicUsize::new(0),
        }
    }

    /// Do not report a total in page metadata.
    pub fn without_total(mut self) -> Self {
        self.report_total = false;
        self
    }

    /// Behave like APIs that answer 404 once the data runs out.
    pub fn not_found_past_end(mut self) -> Self {
        self.not_found_past_end = true;
        self
    }

    /// Fail the next `times` fetches of `page`.
    pub fn fail_page(
        &self,
        page: u32,
        times: usize,
        make: impl Fn() -> UpstreamError + Send + Sync + 'static,
    ) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(page, (times, Box::new(make)));
    }

    /// Make the record with this index undecodable.
    pub fn corrupt_record(&self, index: u32) {
        self.malformed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(index);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = Some(latency);
    }

    /// Change every record's content.
    pub fn bump_revision(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    pub fn fetch_count(&self, page: u32) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&page)
            .copied()
            .unwrap_or(0)
    }

    pub fn completed_fetches(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    fn take_failure(&self, page: u32) -> Option<UpstreamError> {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let (remaining, make) = failures.get_mut(&page)?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(make())
    }
}

#[async_trait]
impl UpstreamSource for FakeSource {
    async fn fetch_page(&self, page: u32, page_size: u32) -> UpstreamResult<Page> {
        *self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(page)
            .or_default() += 1;

        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(err) = self.take_failure(page) {
            return Err(err);
        }

        let total = self.total.load(Ordering::SeqCst);
        let revision = self.revision.load(Ordering::SeqCst);
        let malformed = self
            .malformed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let start = u64::from(page.saturating_sub(1)) * u64::from(page_size);
        if self.not_found_past_end && start >= total {
            return Err(UpstreamError::NotFound {
                url: format!("https://api.example.com/listings?page={page}"),
            });
        }
        let end = (start + u64::from(page_size)).min(total);
        let records = (start..end)
            .map(|i| {
                if malformed.contains(&(i as u32)) {
                    serde_json::json!({"title": "missing id", "year": "soon"})
                } else {
                    serde_json::json!({
                        "id": i,
                        "title": format!("Vehicle {i}"),
                        "make": "Porsche",
                        "model": "911",
                        "year": 1990 + (i % 30),
                        "price": 50_000 + i * 10 + revision,
                        "views": i * 7 + revision,
                    })
                }
            })
            .collect::<Vec<_>>();

        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(Page {
            number: page,
            has_more: self.not_found_past_end || end < total,
            total: self.report_total.then_some(total),
            records,
        })
    }
}

/// Listing and progress store held in memory with the same compare-and-set
/// semantics as the database store.
#[derive(Default)]
pub struct MemoryStore {
    listings: Mutex<HashMap<String, ListingModel>>,
    runs: Mutex<HashMap<Uuid, SyncRun>>,
    /// Every successfully saved snapshot, in order.
    history: Mutex<Vec<SyncRun>>,
    upsert_failures: Mutex<VecDeque<ErrorFactory<StoreError>>>,
    upsert_calls: AtomicUsize,
    rows_written: AtomicU64,
}

impl MemoryStore {
    /// Fail the next `times` upserts.
    pub fn fail_upserts(&self, times: usize, make: impl Fn() -> StoreError + Send + Sync + 'static) {
        let make: std::sync::Arc<dyn Fn() -> StoreError + Send + Sync> = std::sync::Arc::new(make);
        let mut failures = self
            .upsert_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for _ in 0..times {
            let make = std::sync::Arc::clone(&make);
            failures.push_back(Box::new(move || make()));
        }
    }

    pub fn listing_count(&self) -> usize {
        self.listings.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn listing(&self, external_id: &str) -> Option<ListingModel> {
        self.listings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(external_id)
            .cloned()
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::SeqCst)
    }

    pub fn history(&self) -> Vec<SyncRun> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Overwrite a stored run without any revision check.
    pub fn put_run(&self, run: SyncRun) {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run.run_id, run);
    }

    pub fn run(&self, run_id: Uuid) -> Option<SyncRun> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&run_id)
            .cloned()
    }
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn upsert_batch(&self, records: Vec<ListingModel>) -> StoreResult<u64> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        let failure = self
            .upsert_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(make) = failure {
            return Err(make());
        }

        let mut listings = self.listings.lock().unwrap_or_else(|e| e.into_inner());
        let mut changed = 0;
        for record in records {
            match listings.get_mut(&record.external_id) {
                Some(existing) if existing.content_fingerprint == record.content_fingerprint => {}
                Some(existing) => {
                    let first_seen_at = existing.first_seen_at;
                    *existing = ListingModel {
                        first_seen_at,
                        ..record
                    };
                    changed += 1;
                }
                None => {
                    listings.insert(record.external_id.clone(), record);
                    changed += 1;
                }
            }
        }
        self.rows_written.fetch_add(changed, Ordering::SeqCst);
        Ok(changed)
    }

    async fn fingerprints(&self, external_ids: &[String]) -> StoreResult<HashMap<String, String>> {
        let listings = self.listings.lock().unwrap_or_else(|e| e.into_inner());
        Ok(external_ids
            .iter()
            .filter_map(|id| {
                listings
                    .get(id)
                    .map(|l| (id.clone(), l.content_fingerprint.clone()))
            })
            .collect())
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn get_progress(&self, run_id: Uuid) -> StoreResult<Option<SyncRun>> {
        Ok(self.run(run_id))
    }

    async fn latest_run(&self) -> StoreResult<Option<SyncRun>> {
        Ok(self
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn save_progress(&self, run: &mut SyncRun) -> StoreResult<()> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let stored_revision = runs.get(&run.run_id).map(|r| r.revision);
        let expected = (run.revision != 0).then_some(run.revision);
        if stored_revision != expected {
            return Err(StoreError::Conflict {
                run_id: run.run_id,
                expected: run.revision,
            });
        }

        run.revision += 1;
        runs.insert(run.run_id, run.clone());
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(run.clone());
        Ok(())
    }

    async fn mark_stalled(
        &self,
        run_id: Uuid,
        observed_revision: i64,
        idle_since: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(run) = runs.get_mut(&run_id) else {
            return Ok(false);
        };
        if run.status != RunStatus::Running || run.revision != observed_revision {
            return Ok(false);
        }

        let idle_secs = (Utc::now() - idle_since).num_seconds().max(0);
        run.status = RunStatus::Failed;
        run.last_error = Some(format!("no progress for {idle_secs}s"));
        run.last_error_kind = Some(crate::store::STALLED_KIND.to_string());
        run.revision += 1;
        Ok(true)
    }
}
