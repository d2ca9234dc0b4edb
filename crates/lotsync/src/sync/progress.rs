//! Progress reporting types for sync runs.
//!
//! The engine emits [`SyncProgress`] events through an optional callback so
//! front ends (the CLI's logging reporter, tests) can observe a run without
//! the engine knowing who is listening.

use std::time::Duration;

use uuid::Uuid;

use super::classify::ErrorKind;
use crate::entity::run_status::RunStatus;

/// Progress events emitted by the coordinator, fetch pool, and watchdog.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum SyncProgress {
    /// An invocation began working on a run.
    RunStarted {
        run_id: Uuid,
        source: String,
        /// Page the invocation starts from.
        start_page: u32,
        /// True when continuing an existing run.
        resumed: bool,
    },

    /// A page fetch failed transiently and will be retried.
    PageFetchRetry {
        page: u32,
        /// Time to wait before retry (ms).
        retry_after_ms: u64,
        /// Attempt that just failed (1-based).
        attempt: u32,
        error: String,
    },

    /// One upsert batch committed.
    BatchWritten {
        page: u32,
        /// Records in the batch.
        count: usize,
        /// Rows the database actually changed.
        rows_affected: u64,
    },

    /// A page was fully processed and the checkpoint advanced past it.
    PageCompleted {
        page: u32,
        /// Records the upstream returned.
        fetched: usize,
        /// Rows written.
        written: u64,
        /// Records skipped because their fingerprint matched.
        unchanged: usize,
        /// Records that failed to decode.
        malformed: usize,
        /// Running total for the run.
        records_processed: u64,
        elapsed_ms: u64,
    },

    /// A page was given up on after exhausting retries.
    PageSkipped {
        page: u32,
        kind: ErrorKind,
        error: String,
        error_count: u32,
    },

    /// The invocation handed control back with the run still `running`.
    RunYielded {
        run_id: Uuid,
        reason: String,
        current_page: u32,
        records_processed: u64,
    },

    /// The invocation ended the run or stopped on a failure.
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
        records_processed: u64,
        records_written: u64,
        elapsed_ms: u64,
    },

    /// The watchdog found a running run that stopped making progress.
    StallDetected { run_id: Uuid, idle: Duration },

    /// The watchdog is resuming a run.
    ResumeScheduled { run_id: Uuid, from_page: u32 },

    /// The watchdog is starting a brand-new run.
    FreshRunScheduled { previous: Option<Uuid> },

    /// The watchdog stopped auto-resuming after repeated connectivity failures.
    AutoResumeSuspended {
        run_id: Uuid,
        connectivity_failures: u32,
    },

    /// Warning message (non-fatal).
    Warning { message: String },
}

/// Callback for progress updates during sync operations.
pub type ProgressCallback = Box<dyn Fn(SyncProgress) + Send + Sync>;

/// Emit a progress event if a callback is provided.
///
/// This is a convenience function to avoid repetitive `if let Some(cb) = ...` patterns.
///
/// # Example
///
/// ```ignore
/// use lotsync::sync::{emit, SyncProgress, ProgressCallback};
///
/// fn report(on_progress: Option<&ProgressCallback>) {
///     emit(on_progress, SyncProgress::Warning { message: "slow upstream".into() });
/// }
/// ```
#[inline]
pub fn emit(on_progress: Option<&ProgressCallback>, event: SyncProgress) {
    if let Some(cb) = on_progress {
        cb(event);
    }
}
