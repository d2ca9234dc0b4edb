//! Initial migration creating the listing replica and run progress tables.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        self.create_listings(manager).await?;
        self.create_sync_runs(manager).await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncRuns::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Listings::Table).to_owned())
            .await?;
        Ok(())
    }
}

impl Migration {
    async fn create_listings(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Listings::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Listings::ExternalId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    // Vehicle
                    .col(ColumnDef::new(Listings::Title).text().not_null())
                    .col(ColumnDef::new(Listings::Make).string().null())
                    .col(ColumnDef::new(Listings::ModelName).string().null())
                    .col(ColumnDef::new(Listings::Year).integer().null())
                    .col(ColumnDef::new(Listings::Vin).string().null())
                    // Offer
                    .col(ColumnDef::new(Listings::PriceCents).big_integer().null())
                    .col(ColumnDef::new(Listings::Currency).string().null())
                    .col(ColumnDef::new(Listings::Mileage).big_integer().null())
                    .col(ColumnDef::new(Listings::Status).string().null())
                    .col(ColumnDef::new(Listings::Location).string().null())
                    .col(
                        ColumnDef::new(Listings::Images)
                            .json()
                            .not_null()
                            .default(Expr::cust("'[]'")),
                    )
                    .col(
                        ColumnDef::new(Listings::AuctionEndsAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Listings::Attributes)
                            .json()
                            .not_null()
                            .default(Expr::cust("'{}'")),
                    )
                    // Tracking
                    .col(
                        ColumnDef::new(Listings::ContentFingerprint)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Listings::FirstSeenAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Listings::LastSyncedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Catalog queries sort and filter on these
        manager
            .create_index(
                Index::create()
                    .name("idx_listings_make_model_year")
                    .table(Listings::Table)
                    .col(Listings::Make)
                    .col(Listings::ModelName)
                    .col(Listings::Year)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_listings_auction_ends_at")
                    .table(Listings::Table)
                    .col(Listings::AuctionEndsAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_listings_last_synced_at")
                    .table(Listings::Table)
                    .col(Listings::LastSyncedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn create_sync_runs(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncRuns::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SyncRuns::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(SyncRuns::Source).string().not_null())
                    .col(
                        ColumnDef::new(SyncRuns::Status)
                            .string()
                            .not_null()
                            .default("idle"),
                    )
                    // Checkpoint
                    .col(
                        ColumnDef::new(SyncRuns::CurrentPage)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(SyncRuns::RecordsProcessed)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncRuns::RecordsWritten)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncRuns::ConsecutiveEmptyPages)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncRuns::ErrorCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncRuns::ResumeCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(SyncRuns::ExpectedTotal).big_integer().null())
                    // Timestamps
                    .col(
                        ColumnDef::new(SyncRuns::StartedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncRuns::LastActivityAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncRuns::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    // Diagnostics
                    .col(ColumnDef::new(SyncRuns::LastError).text().null())
                    .col(ColumnDef::new(SyncRuns::LastErrorKind).string().null())
                    .col(
                        ColumnDef::new(SyncRuns::Metadata)
                            .json()
                            .not_null()
                            .default(Expr::cust("'{}'")),
                    )
                    .col(
                        ColumnDef::new(SyncRuns::Revision)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .to_owned(),
            )
            .await?;

        // "Latest run" lookups order by start time
        manager
            .create_index(
                Index::create()
                    .name("idx_sync_runs_started_at")
                    .table(SyncRuns::Table)
                    .col(SyncRuns::StartedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum Listings {
    Table,
    ExternalId,
    Title,
    Make,
    ModelName,
    Year,
    Vin,
    PriceCents,
    Currency,
    Mileage,
    Status,
    Location,
    Images,
    AuctionEndsAt,
    Attributes,
    ContentFingerprint,
    FirstSeenAt,
    LastSyncedAt,
}

#[derive(DeriveIden)]
enum SyncRuns {
    Table,
    Id,
    Source,
    Status,
    CurrentPage,
    RecordsProcessed,
    RecordsWritten,
    ConsecutiveEmptyPages,
    ErrorCount,
    ResumeCount,
    ExpectedTotal,
    StartedAt,
    LastActivityAt,
    CompletedAt,
    LastError,
    LastErrorKind,
    Metadata,
    Revision,
}
