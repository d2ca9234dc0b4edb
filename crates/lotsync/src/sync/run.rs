//! The SyncRun value object and its persisted metadata.

use chrono::{DateTime, Utc};
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::run_status::RunStatus;
use crate::entity::sync_run::{ActiveModel as SyncRunActiveModel, Model as SyncRunModel};

use super::classify::ErrorKind;

/// Most skipped page numbers kept in metadata; older entries are dropped first.
pub const MAX_SKIPPED_PAGES_TRACKED: usize = 500;

/// Why an invocation handed control back without finishing the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YieldReason {
    /// The per-invocation wall-clock budget ran out.
    Deadline,
    /// The shutdown flag was raised.
    Cancelled,
    /// The upstream stopped reporting more pages but the watermark was not met.
    UpstreamExhausted,
}

impl YieldReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deadline => "deadline",
            Self::Cancelled => "cancelled",
            Self::UpstreamExhausted => "upstream_exhausted",
        }
    }
}

/// Free-form bookkeeping stored alongside a run.
///
/// Unknown keys are ignored and missing keys default, so older rows decode
/// under newer code and vice versa.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunMetadata {
    /// Pages skipped after exhausting retries.
    pub skipped_pages: Vec<u32>,
    /// Records that failed to decode.
    pub malformed_records: u64,
    /// Records fetched whose fingerprint matched the stored one.
    pub records_unchanged: u64,
    /// Consecutive invocations that ended on a connectivity failure.
    pub connectivity_failures: u32,
    pub last_yield_reason: Option<YieldReason>,
}

impl RunMetadata {
    /// Remember a skipped page, keeping the list bounded.
    pub fn record_skipped_page(&mut self, page: u32) {
        if self.skipped_pages.len() >= MAX_SKIPPED_PAGES_TRACKED {
            self.skipped_pages.remove(0);
        }
        self.skipped_pages.push(page);
    }
}

/// One logical synchronization attempt.
///
/// The same `run_id` is reused across every resume until the run completes or
/// a fresh run supersedes it.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRun {
    pub run_id: Uuid,
    pub source: String,
    pub status: RunStatus,
    /// Next page to fetch (1-indexed).
    pub current_page: u32,
    pub records_processed: u64,
    pub records_written: u64,
    pub consecutive_empty_pages: u32,
    pub error_count: u32,
    pub resume_count: u32,
    pub expected_total: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_kind: Option<String>,
    pub metadata: RunMetadata,
    /// Compare-and-set token; 0 means never persisted.
    pub revision: i64,
}

impl SyncRun {
    /// A fresh, never-persisted run starting at page 1.
    pub fn new(source: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            source: source.into(),
            status: RunStatus::Idle,
            current_page: 1,
            records_processed: 0,
            records_written: 0,
            consecutive_empty_pages: 0,
            error_count: 0,
            resume_count: 0,
            expected_total: None,
            started_at: now,
            last_activity_at: now,
            completed_at: None,
            last_error: None,
            last_error_kind: None,
            metadata: RunMetadata::default(),
            revision: 0,
        }
    }

    /// Processed share of the expected total, if one is known and non-zero.
    pub fn fraction_complete(&self) -> Option<f64> {
        match self.expected_total {
            Some(total) if total > 0 => Some(self.records_processed as f64 / total as f64),
            _ => None,
        }
    }

    /// Whether the processed fraction reached `watermark`.
    ///
    /// Always false without a known expected total.
    pub fn meets_watermark(&self, watermark: f64) -> bool {
        self.fraction_complete().is_some_and(|f| f >= watermark)
    }

    /// Whether the most recent failure was a connectivity failure.
    pub fn is_connectivity_failure(&self) -> bool {
        self.last_error_kind.as_deref() == Some(ErrorKind::Connectivity.as_str())
    }

    /// Time since the last recorded activity, clamped at zero.
    pub fn idle_for(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.last_activity_at).to_std().unwrap_or_default()
    }

    /// Record a page-level error.
    pub fn record_error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.last_error = Some(message.into());
        self.last_error_kind = Some(kind.as_str().to_string());
    }

    /// Mark activity now.
    #[inline]
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    pub fn to_active_model(&self) -> SyncRunActiveModel {
        SyncRunActiveModel {
            id: Set(self.run_id),
            source: Set(self.source.clone()),
            status: Set(self.status),
            current_page: Set(i32::try_from(self.current_page).unwrap_or(i32::MAX)),
            records_processed: Set(i64::try_from(self.records_processed).unwrap_or(i64::MAX)),
            records_written: Set(i64::try_from(self.records_written).unwrap_or(i64::MAX)),
            consecutive_empty_pages: Set(
                i32::try_from(self.consecutive_empty_pages).unwrap_or(i32::MAX)
            ),
            error_count: Set(i32::try_from(self.error_count).unwrap_or(i32::MAX)),
            resume_count: Set(i32::try_from(self.resume_count).unwrap_or(i32::MAX)),
            expected_total: Set(self
                .expected_total
                .map(|t| i64::try_from(t).unwrap_or(i64::MAX))),
            started_at: Set(self.started_at.fixed_offset()),
            last_activity_at: Set(self.last_activity_at.fixed_offset()),
            completed_at: Set(self.completed_at.map(|t| t.fixed_offset())),
            last_error: Set(self.last_error.clone()),
            last_error_kind: Set(self.last_error_kind.clone()),
            metadata: Set(serde_json::to_value(&self.metadata).unwrap_or_default()),
            revision: Set(self.revision),
        }
    }
}

impl From<SyncRunModel> for SyncRun {
    fn from(model: SyncRunModel) -> Self {
        let metadata = serde_json::from_value(model.metadata).unwrap_or_else(|e| {
            tracing::warn!(run_id = %model.id, error = %e, "Ignoring unreadable run metadata");
            RunMetadata::default()
        });

        Self {
            run_id: model.id,
            source: model.source,
            status: model.status,
            current_page: u32::try_from(model.current_page).unwrap_or(1).max(1),
            records_processed: u64::try_from(model.records_processed).unwrap_or(0),
            records_written: u64::try_from(model.records_written).unwrap_or(0),
            consecutive_empty_pages: u32::try_from(model.consecutive_empty_pages).unwrap_or(0),
            error_count: u32::try_from(model.error_count).unwrap_or(0),
            resume_count: u32::try_from(model.resume_count).unwrap_or(0),
            expected_total: model.expected_total.and_then(|t| u64::try_from(t).ok()),
            started_at: model.started_at.with_timezone(&Utc),
            last_activity_at: model.last_activity_at.with_timezone(&Utc),
            completed_at: model.completed_at.map(|t| t.with_timezone(&Utc)),
            last_error: model.last_error,
            last_error_kind: model.last_error_kind,
            metadata,
            revision: model.revision,
        }
    }
}
