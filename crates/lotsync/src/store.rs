//! Destination and progress stores.
//!
//! The engine talks to persistence only through the [`ListingStore`] and
//! [`ProgressStore`] traits. [`DbStore`] implements both over a sea-orm
//! connection; tests substitute in-memory fakes.

mod bulk;
mod errors;
mod progress;
mod query;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use uuid::Uuid;

use crate::entity::listing::Model as ListingModel;
use crate::sync::SyncRun;

pub use bulk::upsert_listings;
pub use errors::{Result, StoreError};
pub use progress::{STALLED_KIND, find_run, latest_run, mark_stalled, save_run};
pub use query::{count_listings, find_listing, fingerprints};

/// Write side of the local listing replica.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Idempotently upsert a batch, returning the number of rows that changed.
    async fn upsert_batch(&self, records: Vec<ListingModel>) -> Result<u64>;

    /// Stored fingerprints for the given ids; unknown ids are omitted.
    async fn fingerprints(&self, external_ids: &[String]) -> Result<HashMap<String, String>>;
}

/// Durable home of [`SyncRun`] records.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn get_progress(&self, run_id: Uuid) -> Result<Option<SyncRun>>;

    async fn latest_run(&self) -> Result<Option<SyncRun>>;

    /// Insert or compare-and-set update; advances `run.revision` on success.
    async fn save_progress(&self, run: &mut SyncRun) -> Result<()>;

    /// Flip `running -> failed` only if the stored revision is still `observed_revision`.
    async fn mark_stalled(
        &self,
        run_id: Uuid,
        observed_revision: i64,
        idle_since: DateTime<Utc>,
    ) -> Result<bool>;
}

/// Database-backed implementation of both store traits.
#[derive(Clone)]
pub struct DbStore {
    db: Arc<DatabaseConnection>,
}

impl DbStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// The underlying connection.
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait]
impl ListingStore for DbStore {
    async fn upsert_batch(&self, records: Vec<ListingModel>) -> Result<u64> {
        upsert_listings(&self.db, records).await
    }

    async fn fingerprints(&self, external_ids: &[String]) -> Result<HashMap<String, String>> {
        fingerprints(&self.db, external_ids).await
    }
}

#[async_trait]
impl ProgressStore for DbStore {
    async fn get_progress(&self, run_id: Uuid) -> Result<Option<SyncRun>> {
        find_run(&self.db, run_id).await
    }

    async fn latest_run(&self) -> Result<Option<SyncRun>> {
        latest_run(&self.db).await
    }

    async fn save_progress(&self, run: &mut SyncRun) -> Result<()> {
        save_run(&self.db, run).await
    }

    async fn mark_stalled(
        &self,
        run_id: Uuid,
        observed_revision: i64,
        idle_since: DateTime<Utc>,
    ) -> Result<bool> {
        mark_stalled(&self.db, run_id, observed_revision, idle_since).await
    }
}
