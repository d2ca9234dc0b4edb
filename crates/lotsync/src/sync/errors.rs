use thiserror::Error;

use super::classify::{Classify, ErrorKind};
use crate::store::StoreError;
use crate::upstream::UpstreamError;

/// Errors that escape a trigger invocation.
///
/// Page-level failures are absorbed into the run; only an unusable progress
/// store surfaces here.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl Classify for SyncError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::Upstream(e) => e.kind(),
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;
