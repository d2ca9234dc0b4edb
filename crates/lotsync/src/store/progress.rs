use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveEnum, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    sea_query::Expr,
};
use uuid::Uuid;

use crate::entity::run_status::RunStatus;
use crate::entity::sync_run::{Column, Entity as SyncRunEntity};
use crate::sync::SyncRun;

use super::errors::{Result, StoreError};

/// `last_error_kind` recorded when the watchdog fails a stalled run.
pub const STALLED_KIND: &str = "stalled";

/// Fetch a run by id.
pub async fn find_run(db: &DatabaseConnection, run_id: Uuid) -> Result<Option<SyncRun>> {
    let model = SyncRunEntity::find_by_id(run_id).one(db).await?;
    Ok(model.map(SyncRun::from))
}

/// Fetch the most recently started run.
pub async fn latest_run(db: &DatabaseConnection) -> Result<Option<SyncRun>> {
    let model = SyncRunEntity::find()
        .order_by_desc(Column::StartedAt)
        .one(db)
        .await?;
    Ok(model.map(SyncRun::from))
}

/// Persist a run snapshot.
///
/// A run with revision 0 is inserted. Otherwise the row is updated only if its
/// stored revision still equals `run.revision`; a lost race yields
/// [`StoreError::Conflict`]. On success `run.revision` is advanced.
pub async fn save_run(db: &DatabaseConnection, run: &mut SyncRun) -> Result<()> {
    let next_revision = run.revision + 1;
    let mut model = run.to_active_model();
    model.revision = sea_orm::Set(next_revision);

    if run.revision == 0 {
        SyncRunEntity::insert(model)
            .exec_without_returning(db)
            .await?;
    } else {
        let result = SyncRunEntity::update_many()
            .set(model)
            .filter(Column::Id.eq(run.run_id))
            .filter(Column::Revision.eq(run.revision))
            .exec(db)
            .await?;

        if result.rows_affected == 0 {
            return Err(StoreError::Conflict {
                run_id: run.run_id,
                expected: run.revision,
            });
        }
    }

    run.revision = next_revision;
    Ok(())
}

/// Flip a `running` run to `failed` if nobody wrote to it since `observed_revision`.
///
/// Returns `false` when the run moved on in the meantime (the coordinator
/// made progress or another watchdog got there first).
pub async fn mark_stalled(
    db: &DatabaseConnection,
    run_id: Uuid,
    observed_revision: i64,
    idle_since: DateTime<Utc>,
) -> Result<bool> {
    let idle_secs = (Utc::now() - idle_since).num_seconds().max(0);
    let result = SyncRunEntity::update_many()
        .col_expr(Column::Status, Expr::value(RunStatus::Failed.to_value()))
        .col_expr(
            Column::LastError,
            Expr::value(format!("no progress for {idle_secs}s")),
        )
        .col_expr(Column::LastErrorKind, Expr::value(STALLED_KIND))
        .col_expr(Column::Revision, Expr::col(Column::Revision).add(1))
        .filter(Column::Id.eq(run_id))
        .filter(Column::Status.eq(RunStatus::Running))
        .filter(Column::Revision.eq(observed_revision))
        .exec(db)
        .await?;

    Ok(result.rows_affected == 1)
}
