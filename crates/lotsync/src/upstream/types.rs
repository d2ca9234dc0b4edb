use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::errors::Result;

/// One page of raw upstream records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Page number (1-indexed).
    pub number: u32,
    /// Raw records; decoding happens per record so one bad item can't sink the page.
    pub records: Vec<serde_json::Value>,
    /// Whether the upstream claims more pages follow.
    pub has_more: bool,
    /// Total record count, when the upstream reports one.
    pub total: Option<u64>,
}

impl Page {
    /// A page with no records and nothing after it.
    pub fn empty(number: u32) -> Self {
        Self {
            number,
            records: Vec::new(),
            has_more: false,
            total: None,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A paginated source of listings.
///
/// Implementations must be safe to call concurrently for different pages.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    async fn fetch_page(&self, page: u32, page_size: u32) -> Result<Page>;
}

/// Upstream fields that change without the listing changing (counters, clocks).
///
/// These are dropped before fingerprinting and storage.
pub const VOLATILE_FIELDS: &[&str] = &[
    "views",
    "view_count",
    "viewCount",
    "watchers",
    "watcher_count",
    "watch_count",
    "watchCount",
    "fetched_at",
    "fetchedAt",
    "server_time",
    "time_remaining",
    "time_left",
    "seconds_remaining",
];

/// A vehicle listing as published by the auction API.
///
/// Field names accept the common spellings seen across auction feeds. Any
/// field not mapped here is kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleListing {
    #[serde(
        rename = "id",
        alias = "external_id",
        alias = "listing_id",
        alias = "lot_id",
        deserialize_with = "string_or_number"
    )]
    pub external_id: String,
    #[serde(default, alias = "name")]
    pub title: String,
    #[serde(default)]
    pub make: Option<String>,
    #[serde(default, rename = "model")]
    pub model_name: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub vin: Option<String>,
    /// Price in major currency units (e.g. dollars).
    #[serde(default, alias = "current_bid", alias = "currentBid")]
    pub price: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default, alias = "odometer")]
    pub mileage: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default, alias = "photos")]
    pub images: Vec<String>,
    #[serde(
        default,
        alias = "ends_at",
        alias = "endsAt",
        alias = "auction_end",
        alias = "auctionEndsAt"
    )]
    pub auction_ends_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl VehicleListing {
    /// Decode one raw record, stripping volatile fields.
    ///
    /// # Errors
    /// Returns the serde error when the record lacks an id or has mistyped fields.
    pub fn from_value(value: serde_json::Value) -> serde_json::Result<Self> {
        let mut listing: Self = serde_json::from_value(value)?;
        listing
            .extra
            .retain(|key, _| !VOLATILE_FIELDS.contains(&key.as_str()));
        Ok(listing)
    }

    /// Price converted to minor units, rounded to the nearest cent.
    pub fn price_cents(&self) -> Option<i64> {
        self.price
            .filter(|p| p.is_finite())
            .map(|p| (p * 100.0).round() as i64)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!(
            "expected a non-empty string or number id, got {other}"
        ))),
    }
}
