use sea_orm::DbErr;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in the listing and progress stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from sea-orm.
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    /// A progress write lost a compare-and-set race (another writer advanced the run).
    #[error("Sync run {run_id} was modified concurrently (expected revision {expected})")]
    Conflict { run_id: Uuid, expected: i64 },

    /// Sync run not found.
    #[error("Sync run not found: {run_id}")]
    RunNotFound { run_id: Uuid },

    /// A background write task panicked or was cancelled.
    #[error("Write task failed: {message}")]
    Task { message: String },
}

impl StoreError {
    /// Whether this error means another writer took over the run.
    #[inline]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
