//! Failure classification.
//!
//! Every error the engine can observe maps to one [`ErrorKind`], and the kind
//! alone decides what happens next: retry locally, skip the page, stop the
//! invocation, or fail the run.

use std::fmt;

use sea_orm::DbErr;

use crate::store::StoreError;
use crate::upstream::UpstreamError;

/// Coarse failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The upstream or the database cannot be reached at all.
    Connectivity,
    /// Worth retrying after a backoff.
    Transient,
    /// Bad payload; retrying will not help.
    Data,
    /// Unrecoverable for this run.
    Fatal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connectivity => "connectivity",
            Self::Transient => "transient",
            Self::Data => "data",
            Self::Fatal => "fatal",
        }
    }

    /// Whether the shared retry policy should retry this kind.
    #[inline]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that know their [`ErrorKind`].
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

impl Classify for UpstreamError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Unreachable { .. } | Self::NotFound { .. } | Self::Unauthorized { .. } => {
                ErrorKind::Connectivity
            }
            Self::RateLimited { .. }
            | Self::Server { .. }
            | Self::Timeout { .. }
            | Self::Transport { .. } => ErrorKind::Transient,
            Self::Status { .. } | Self::Decode { .. } => ErrorKind::Data,
            Self::Worker { .. } => ErrorKind::Fatal,
        }
    }
}

/// Check if a database error is worth retrying (lock contention, timeouts).
pub fn is_retryable_db_error(err: &DbErr) -> bool {
    match err {
        DbErr::ConnectionAcquire(_) => true,
        DbErr::Exec(_) | DbErr::Query(_) => {
            let err_str = err.to_string().to_lowercase();
            // SQLite: database is locked / busy; PostgreSQL: statement timeout
            err_str.contains("locked")
                || err_str.contains("busy")
                || err_str.contains("timeout")
                || err_str.contains("temporarily unavailable")
        }
        _ => false,
    }
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Database(err) if is_retryable_db_error(err) => ErrorKind::Transient,
            Self::Database(DbErr::Conn(_)) => ErrorKind::Connectivity,
            Self::Database(_) => ErrorKind::Data,
            Self::Conflict { .. } => ErrorKind::Fatal,
            Self::RunNotFound { .. } | Self::Task { .. } => ErrorKind::Data,
        }
    }
}
