use sea_orm::{
    DatabaseConnection, EntityTrait,
    sea_query::{Alias, Expr, OnConflict},
};

use crate::entity::listing::{Column, Entity as Listing, Model};

use super::errors::{Result, StoreError};

// ─── Bulk Operations ─────────────────────────────────────────────────────────

/// Upsert a batch of listings with a single `INSERT ... ON CONFLICT` statement.
///
/// Conflicts on `external_id` update the row only when the stored
/// `content_fingerprint` differs from the incoming one, so replaying the same
/// batch is a no-op. `first_seen_at` is never overwritten.
///
/// # Returns
/// The number of rows actually inserted or updated.
pub async fn upsert_listings(db: &DatabaseConnection, models: Vec<Model>) -> Result<u64> {
    if models.is_empty() {
        return Ok(0);
    }

    let count = models.len();
    let rows = Listing::insert_many(models.into_iter().map(Model::into_insertable))
        .on_conflict(build_upsert_on_conflict())
        .exec_without_returning(db)
        .await
        .map_err(StoreError::from)?;

    tracing::trace!(count, rows, "Upserted listing batch");
    Ok(rows)
}

/// Build the ON CONFLICT clause used by [`upsert_listings`].
pub(crate) fn build_upsert_on_conflict() -> OnConflict {
    OnConflict::column(Column::ExternalId)
        .update_columns([
            Column::Title,
            Column::Make,
            Column::ModelName,
            Column::Year,
            Column::Vin,
            Column::PriceCents,
            Column::Currency,
            Column::Mileage,
            Column::Status,
            Column::Location,
            Column::Images,
            Column::AuctionEndsAt,
            Column::Attributes,
            Column::ContentFingerprint,
            Column::LastSyncedAt,
        ])
        .action_and_where(
            Expr::col((Listing, Column::ContentFingerprint))
                .ne(Expr::col((Alias::new("excluded"), Column::ContentFingerprint))),
        )
        .to_owned()
}
