//! SeaORM entity definitions for the lotsync database schema.

pub mod listing;
pub mod prelude;
pub mod run_status;
pub mod sync_run;
