//! Upstream auction API: the paginated source of listings.
//!
//! The engine depends only on the [`UpstreamSource`] trait. [`HttpAuctionSource`]
//! implements it over the [`HttpTransport`](crate::http::HttpTransport)
//! abstraction, and [`ApiRateLimiter`] bounds the request rate across all
//! fetch workers.

mod client;
mod convert;
mod errors;
mod rate_limit;
mod types;

pub use client::{HttpAuctionSource, UpstreamConfig};
pub use convert::to_listing_model;
pub use errors::{Result, UpstreamError};
pub use rate_limit::{ApiRateLimiter, DEFAULT_BURST, DEFAULT_RATE_PER_SECOND};
pub use types::{Page, UpstreamSource, VOLATILE_FIELDS, VehicleListing};
