//! Lotsync - resilient ingestion of vehicle auction listings.
//!
//! This library pages through a remote listing API, detects which records
//! actually changed, and upserts them into a local relational store. Runs are
//! checkpointed after every page, so an interrupted run resumes where it
//! stopped instead of starting over.
//!
//! # Features
//!
//! - `migrate` - Enables database migration support. When enabled, you can use
//!   [`connect_and_migrate`] to automatically run migrations on connection.
//! - `http` - The reqwest-backed [`upstream::HttpAuctionSource`].
//! - `sqlite` / `postgres` - Database backends.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use lotsync::{DbStore, EngineConfig, SyncEngine, TriggerRequest, connect_and_migrate};
//!
//! let db = connect_and_migrate("sqlite://lotsync.db?mode=rwc").await?;
//! let engine = SyncEngine::new(source, Arc::new(DbStore::new(Arc::new(db))), EngineConfig::default());
//!
//! // Keep invoking while the engine asks to continue
//! loop {
//!     let response = engine.trigger(TriggerRequest::resume("cron")).await?;
//!     if !response.should_continue {
//!         break;
//!     }
//! }
//! ```

pub mod db;
pub mod entity;
pub mod http;
pub mod retry;
pub mod store;
pub mod sync;
pub mod upstream;

#[cfg(feature = "migrate")]
pub mod migration;

pub use db::connect;
#[cfg(feature = "migrate")]
pub use db::connect_and_migrate;
pub use entity::prelude::*;
pub use store::{DbStore, ListingStore, ProgressStore, StoreError};
pub use sync::{
    EngineConfig, ErrorKind, SyncEngine, SyncError, SyncRun, TriggerRequest, TriggerResponse,
    Watchdog, WatchdogConfig,
};
pub use upstream::{HttpAuctionSource, UpstreamConfig, UpstreamError, UpstreamSource};
