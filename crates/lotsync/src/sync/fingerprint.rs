//! Content fingerprints for change detection.
//!
//! A fingerprint is the SHA-256 of a fixed-order serialization of a listing's
//! mutable fields. Volatile upstream fields are stripped during decoding, and
//! attribute keys are sorted, so the same listing always hashes the same.

use std::collections::BTreeMap;

use chrono::SecondsFormat;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::upstream::VehicleListing;

/// Field order here is the canonical order. Changing it invalidates every
/// stored fingerprint and forces a full rewrite on the next run.
#[derive(Serialize)]
struct Canonical<'a> {
    title: &'a str,
    make: Option<&'a str>,
    model: Option<&'a str>,
    year: Option<i32>,
    vin: Option<&'a str>,
    price_cents: Option<i64>,
    currency: Option<&'a str>,
    mileage: Option<i64>,
    status: Option<&'a str>,
    location: Option<&'a str>,
    images: &'a [String],
    auction_ends_at: Option<String>,
    attributes: BTreeMap<&'a str, &'a serde_json::Value>,
}

/// Compute the content fingerprint of a listing as lowercase hex.
pub fn fingerprint(listing: &VehicleListing) -> String {
    let canonical = Canonical {
        title: listing.title.trim(),
        make: listing.make.as_deref(),
        model: listing.model_name.as_deref(),
        year: listing.year,
        vin: listing.vin.as_deref(),
        price_cents: listing.price_cents(),
        currency: listing.currency.as_deref(),
        mileage: listing.mileage,
        status: listing.status.as_deref(),
        location: listing.location.as_deref(),
        images: &listing.images,
        auction_ends_at: listing
            .auction_ends_at
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
        attributes: listing
            .extra
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .collect(),
    };

    // Serializing borrowed strings, numbers and JSON values cannot fail.
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

/// Whether a record must be written given the stored fingerprint.
///
/// Records that were never stored are always changed.
#[inline]
pub fn has_changed(existing: Option<&str>, new: &str) -> bool {
    existing != Some(new)
}
