//! Conversion from upstream listings to database models.

use chrono::{DateTime, Utc};

use super::types::VehicleListing;
use crate::entity::listing::Model as ListingModel;
use crate::sync::fingerprint::fingerprint;

/// Convert a decoded upstream listing to a storable model.
///
/// `first_seen_at` is set to `now` here; the upsert never overwrites it on
/// conflict, so existing rows keep their original value.
pub fn to_listing_model(listing: VehicleListing, now: DateTime<Utc>) -> ListingModel {
    let content_fingerprint = fingerprint(&listing);
    let price_cents = listing.price_cents();
    let now = now.fixed_offset();

    ListingModel {
        external_id: listing.external_id,
        title: listing.title,
        make: listing.make,
        model_name: listing.model_name,
        year: listing.year,
        vin: listing.vin,
        price_cents,
        currency: listing.currency,
        mileage: listing.mileage,
        status: listing.status,
        location: listing.location,
        images: serde_json::Value::from(listing.images),
        auction_ends_at: listing.auction_ends_at.map(|t| t.fixed_offset()),
        attributes: serde_json::Value::Object(listing.extra),
        content_fingerprint,
        first_seen_at: now,
        last_synced_at: now,
    }
}
