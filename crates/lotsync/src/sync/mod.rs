//! The synchronization engine.
//!
//! # Module Structure
//!
//! - [`coordinator`] - [`SyncEngine`]: one invocation of a run, checkpointed per page
//! - [`watchdog`] - stall detection and auto-resume policy
//! - [`fetch`] - in-order prefetching page fetch pool
//! - [`batch_writer`] - parallel batch upserts for one page
//! - [`run`] - the persisted [`SyncRun`] value object
//! - [`types`] - configuration, trigger request/response, constants
//! - [`progress`] - progress reporting: `SyncProgress`, `ProgressCallback`, `emit()`
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use lotsync::store::DbStore;
//! use lotsync::sync::{EngineConfig, SyncEngine, TriggerRequest};
//! use lotsync::upstream::{HttpAuctionSource, UpstreamConfig};
//!
//! let db = lotsync::connect_and_migrate("sqlite://lotsync.db?mode=rwc").await?;
//! let config = UpstreamConfig { base_url: "https://api.example.com/listings".into(), ..Default::default() };
//! let source = HttpAuctionSource::new(config, timeout)?;
//! let engine = SyncEngine::new(Arc::new(source), Arc::new(DbStore::new(Arc::new(db))), EngineConfig::default());
//!
//! let response = engine.trigger(TriggerRequest::resume("manual")).await?;
//! println!("{} records processed, continue: {}", response.records_processed, response.should_continue);
//! ```

pub mod batch_writer;
mod classify;
pub mod coordinator;
mod errors;
pub mod fetch;
pub mod fingerprint;
mod progress;
pub mod run;
mod types;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod testing;

pub use classify::{Classify, ErrorKind, is_retryable_db_error};
pub use coordinator::SyncEngine;
pub use errors::{Result, SyncError};
pub use fingerprint::{fingerprint, has_changed};
pub use run::{RunMetadata, SyncRun, YieldReason};
pub use watchdog::{Watchdog, WatchdogAction, WatchdogPolicy, evaluate};

// Re-export types
pub use types::{EngineConfig, TriggerRequest, TriggerResponse, WatchdogConfig};

// Re-export constants
pub use types::{
    DEFAULT_BATCH_SIZE, DEFAULT_COMPLETION_WATERMARK, DEFAULT_DEADLINE_MARGIN_SECS,
    DEFAULT_EMPTY_PAGE_THRESHOLD,
    DEFAULT_FETCH_CONCURRENCY, DEFAULT_MAX_ERROR_COUNT, DEFAULT_MAX_RETRIES,
    DEFAULT_MAX_RUN_DURATION_SECS, DEFAULT_PAGE_SIZE, DEFAULT_PAGE_WRITE_ATTEMPTS,
    DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_STALL_THRESHOLD_SECS, DEFAULT_WRITE_CONCURRENCY,
    INITIAL_BACKOFF_MS, MAX_BACKOFF_MS,
};

// Re-export progress types
pub use progress::{ProgressCallback, SyncProgress, emit};
