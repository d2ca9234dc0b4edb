//! Engine configuration, trigger request/response types, and defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::run_status::RunStatus;
use crate::retry::RetryConfig;
use crate::upstream::{DEFAULT_BURST, DEFAULT_RATE_PER_SECOND};

/// Default number of records requested per page.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Default number of pages in flight at once.
pub const DEFAULT_FETCH_CONCURRENCY: usize = 4;

/// Default upsert batch size.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default number of concurrent batch writes per page.
pub const DEFAULT_WRITE_CONCURRENCY: usize = 4;

/// Consecutive empty pages that end a run.
///
/// Upstream pagination is sparse and unstable, so one empty page proves
/// nothing.
pub const DEFAULT_EMPTY_PAGE_THRESHOLD: u32 = 25;

/// Processed fraction of the expected total that counts as done.
pub const DEFAULT_COMPLETION_WATERMARK: f64 = 0.99;

/// Page-level errors tolerated before the run is failed.
pub const DEFAULT_MAX_ERROR_COUNT: u32 = 50;

/// Attempts at writing one page before it is skipped.
pub const DEFAULT_PAGE_WRITE_ATTEMPTS: u32 = 3;

/// Per-request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Wall-clock budget of one invocation in seconds.
pub const DEFAULT_MAX_RUN_DURATION_SECS: u64 = 280;

/// Part of the budget kept free for the final checkpoint.
pub const DEFAULT_DEADLINE_MARGIN_SECS: u64 = 10;

/// A running run idle for longer than this is considered crashed.
pub const DEFAULT_STALL_THRESHOLD_SECS: u64 = 90;

/// Initial backoff delay in milliseconds.
pub const INITIAL_BACKOFF_MS: u64 = 500;

/// Maximum backoff delay in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Maximum local retries for a transient failure.
pub const DEFAULT_MAX_RETRIES: u32 = 4;

/// Tunables for the run coordinator, fetch pool, and batch writer.
///
/// Durations are plain integers so the struct maps 1:1 onto config files and
/// `LOTSYNC_ENGINE__*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Records per page (`P`).
    pub page_size: u32,
    /// Pages in flight (`K`).
    pub fetch_concurrency: usize,
    /// Sustained request rate (`R`).
    pub rate_per_second: u32,
    /// Token bucket capacity (`C`).
    pub burst: u32,
    pub request_timeout_secs: u64,
    /// Records per upsert statement (`B`).
    pub batch_size: usize,
    /// Concurrent upserts per page (`W`).
    pub write_concurrency: usize,
    pub page_write_attempts: u32,
    pub empty_page_threshold: u32,
    pub completion_watermark: f64,
    pub max_error_count: u32,
    pub max_run_duration_secs: u64,
    /// Pages stop this long before `max_run_duration_secs` runs out (capped
    /// at half the budget).
    pub deadline_margin_secs: u64,
    pub stall_threshold_secs: u64,
    /// Expected record count when the upstream does not report one.
    pub expected_total: Option<u64>,
    pub retry_min_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            rate_per_second: DEFAULT_RATE_PER_SECOND,
            burst: DEFAULT_BURST,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            write_concurrency: DEFAULT_WRITE_CONCURRENCY,
            page_write_attempts: DEFAULT_PAGE_WRITE_ATTEMPTS,
            empty_page_threshold: DEFAULT_EMPTY_PAGE_THRESHOLD,
            completion_watermark: DEFAULT_COMPLETION_WATERMARK,
            max_error_count: DEFAULT_MAX_ERROR_COUNT,
            max_run_duration_secs: DEFAULT_MAX_RUN_DURATION_SECS,
            deadline_margin_secs: DEFAULT_DEADLINE_MARGIN_SECS,
            stall_threshold_secs: DEFAULT_STALL_THRESHOLD_SECS,
            expected_total: None,
            retry_min_delay_ms: INITIAL_BACKOFF_MS,
            retry_max_delay_ms: MAX_BACKOFF_MS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn max_run_duration(&self) -> Duration {
        Duration::from_secs(self.max_run_duration_secs)
    }

    /// Time an invocation may spend fetching and writing pages.
    ///
    /// Every page write has to finish inside this window; what is left of
    /// the budget goes to the final checkpoint.
    pub fn working_budget(&self) -> Duration {
        let budget = self.max_run_duration();
        let margin = Duration::from_secs(self.deadline_margin_secs).min(budget / 2);
        budget.saturating_sub(margin)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }

    /// The shared retry policy for fetches and writes.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(
            Duration::from_millis(self.retry_min_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms.max(self.retry_min_delay_ms)),
            self.max_retries as usize,
        )
    }

    /// Copy with every count raised to a usable minimum.
    pub fn normalized(mut self) -> Self {
        self.page_size = self.page_size.max(1);
        self.fetch_concurrency = self.fetch_concurrency.max(1);
        self.batch_size = self.batch_size.max(1);
        self.write_concurrency = self.write_concurrency.max(1);
        self.page_write_attempts = self.page_write_attempts.max(1);
        self.empty_page_threshold = self.empty_page_threshold.max(1);
        self.completion_watermark = self.completion_watermark.clamp(0.0, 1.0);
        self
    }
}

/// Tunables for the auto-resume loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub tick_interval_secs: u64,
    /// Grace before resuming a run that failed early on.
    pub early_grace_secs: u64,
    pub standard_grace_secs: u64,
    /// Grace after a connectivity failure.
    pub connectivity_grace_secs: u64,
    /// Below this processed fraction a run counts as early.
    pub early_fraction: f64,
    /// Consecutive connectivity failures after which auto-resume stops.
    pub max_connectivity_resumes: u32,
    /// Start a fresh run this long after the last one completed.
    pub resync_interval_secs: Option<u64>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
            early_grace_secs: 5,
            standard_grace_secs: 30,
            connectivity_grace_secs: 300,
            early_fraction: 0.05,
            max_connectivity_resumes: 5,
            resync_interval_secs: None,
        }
    }
}

impl WatchdogConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }
}

/// Input to [`SyncEngine::trigger`](super::SyncEngine::trigger).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerRequest {
    /// Continue the latest unfinished run instead of starting over.
    pub resume: bool,
    /// Page to start from. Ignored when resuming a run that is already past it.
    pub from_page: Option<u32>,
    /// Who asked for the run.
    pub source: String,
}

impl Default for TriggerRequest {
    fn default() -> Self {
        Self {
            resume: true,
            from_page: None,
            source: "manual".to_string(),
        }
    }
}

impl TriggerRequest {
    /// Resume request from the given source.
    pub fn resume(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    /// Request for a brand-new run.
    pub fn fresh(source: impl Into<String>) -> Self {
        Self {
            resume: false,
            from_page: None,
            source: source.into(),
        }
    }
}

/// Outcome of one trigger invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub success: bool,
    pub status: RunStatus,
    pub records_processed: u64,
    pub records_written: u64,
    pub current_page: u32,
    /// The caller should invoke again to continue this run.
    pub should_continue: bool,
    pub run_id: Option<Uuid>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    /// Extra context, e.g. why the invocation yielded.
    pub message: Option<String>,
}
