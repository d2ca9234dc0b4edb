use std::collections::HashMap;

use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, FromQueryResult, PaginatorTrait, QueryFilter,
    QuerySelect,
};

use crate::entity::listing::{Column, Entity as Listing, Model};

use super::errors::Result;

/// Upper bound on bind parameters per lookup (SQLite allows 32766, older builds 999).
const LOOKUP_CHUNK_SIZE: usize = 500;

#[derive(Debug, FromQueryResult)]
struct FingerprintRow {
    external_id: String,
    content_fingerprint: String,
}

/// Load stored fingerprints for the given external ids.
///
/// Ids without a stored row are absent from the returned map.
pub async fn fingerprints(
    db: &DatabaseConnection,
    external_ids: &[String],
) -> Result<HashMap<String, String>> {
    let mut found = HashMap::with_capacity(external_ids.len());

    for chunk in external_ids.chunks(LOOKUP_CHUNK_SIZE) {
        let rows = Listing::find()
            .select_only()
            .column(Column::ExternalId)
            .column(Column::ContentFingerprint)
            .filter(Column::ExternalId.is_in(chunk.iter().cloned()))
            .into_model::<FingerprintRow>()
            .all(db)
            .await?;
        found.extend(
            rows.into_iter()
                .map(|row| (row.external_id, row.content_fingerprint)),
        );
    }

    Ok(found)
}

/// Look up a single listing by its upstream id.
pub async fn find_listing(db: &DatabaseConnection, external_id: &str) -> Result<Option<Model>> {
    Ok(Listing::find_by_id(external_id.to_string()).one(db).await?)
}

/// Count all replicated listings.
pub async fn count_listings(db: &DatabaseConnection) -> Result<u64> {
    Ok(Listing::find().count(db).await?)
}
