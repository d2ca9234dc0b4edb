//! SyncRun entity - durable progress record for one logical synchronization.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::entity::run_status::RunStatus;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sync_runs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Who triggered the run (`manual`, `watchdog`, `cli`, ...).
    pub source: String,
    pub status: RunStatus,

    // ─── Checkpoint ──────────────────────────────────────────────────────────
    /// Next page to fetch (1-indexed).
    pub current_page: i32,
    pub records_processed: i64,
    pub records_written: i64,
    pub consecutive_empty_pages: i32,
    pub error_count: i32,
    pub resume_count: i32,
    pub expected_total: Option<i64>,

    // ─── Timestamps ──────────────────────────────────────────────────────────
    pub started_at: DateTimeWithTimeZone,
    pub last_activity_at: DateTimeWithTimeZone,
    pub completed_at: Option<DateTimeWithTimeZone>,

    // ─── Diagnostics ─────────────────────────────────────────────────────────
    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,
    pub last_error_kind: Option<String>,
    /// Open-ended run metadata; readers ignore unknown keys.
    #[sea_orm(column_type = "Json")]
    pub metadata: serde_json::Value,

    /// Bumped on every write; compare-and-set token for concurrent writers.
    pub revision: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
