//! Common re-exports for convenient entity usage.

pub use super::listing::{
    ActiveModel as ListingActiveModel, Column as ListingColumn, Entity as Listing,
    Model as ListingModel,
};
pub use super::run_status::RunStatus;
pub use super::sync_run::{
    ActiveModel as SyncRunActiveModel, Column as SyncRunColumn, Entity as SyncRunEntity,
    Model as SyncRunModel,
};
