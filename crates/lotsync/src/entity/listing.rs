//! Listing entity - the local replica of one upstream catalog item.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A vehicle listing replicated from the upstream auction API.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "listings")]
pub struct Model {
    /// Upstream natural key, also the upsert conflict target.
    #[sea_orm(primary_key, auto_increment = false)]
    pub external_id: String,

    // ─── Vehicle ─────────────────────────────────────────────────────────────
    #[sea_orm(column_type = "Text")]
    pub title: String,
    pub make: Option<String>,
    pub model_name: Option<String>,
    pub year: Option<i32>,
    pub vin: Option<String>,

    // ─── Offer ───────────────────────────────────────────────────────────────
    /// Asking price or current bid, in minor currency units.
    pub price_cents: Option<i64>,
    pub currency: Option<String>,
    pub mileage: Option<i64>,
    /// Upstream listing status (e.g. `active`, `sold`).
    pub status: Option<String>,
    pub location: Option<String>,
    /// Image URLs, stored as a JSON array.
    #[sea_orm(column_type = "Json")]
    pub images: serde_json::Value,
    pub auction_ends_at: Option<DateTimeWithTimeZone>,
    /// Remaining non-volatile upstream fields.
    #[sea_orm(column_type = "Json")]
    pub attributes: serde_json::Value,

    // ─── Tracking ────────────────────────────────────────────────────────────
    /// SHA-256 hex digest of the mutable field set.
    pub content_fingerprint: String,
    /// Set on insert only.
    pub first_seen_at: DateTimeWithTimeZone,
    /// Updated only when a write actually changes the row.
    pub last_synced_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Build an insertable active model with every column set.
    pub fn into_insertable(self) -> ActiveModel {
        use sea_orm::Set;

        ActiveModel {
            external_id: Set(self.external_id),
            title: Set(self.title),
            make: Set(self.make),
            model_name: Set(self.model_name),
            year: Set(self.year),
            vin: Set(self.vin),
            price_cents: Set(self.price_cents),
            currency: Set(self.currency),
            mileage: Set(self.mileage),
            status: Set(self.status),
            location: Set(self.location),
            images: Set(self.images),
            auction_ends_at: Set(self.auction_ends_at),
            attributes: Set(self.attributes),
            content_fingerprint: Set(self.content_fingerprint),
            first_seen_at: Set(self.first_seen_at),
            last_synced_at: Set(self.last_synced_at),
        }
    }
}
