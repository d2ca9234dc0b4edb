use lotsync::StoreError;
use lotsync::store::{count_listings, find_run, latest_run};
use uuid::Uuid;

use crate::commands::shared::{OutputFormat, RunDisplay, open_store, print_rows};

/// Handle `lotsync status`: show a run (the latest by default) and the
/// number of replicated listings.
pub(crate) async fn handle_status(
    run_id: Option<Uuid>,
    output: OutputFormat,
    database_url: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(database_url).await?;
    let db = store.connection();

    let run = match run_id {
        Some(run_id) => Some(
            find_run(db, run_id)
                .await?
                .ok_or(StoreError::RunNotFound { run_id })?,
        ),
        None => latest_run(db).await?,
    };
    let listings = count_listings(db).await?;

    match output {
        OutputFormat::Table => {
            match &run {
                Some(run) => print_rows(vec![RunDisplay::from(run)], output)?,
                None => println!("No sync runs recorded yet."),
            }
            println!("{listings} listings replicated.");
        }
        OutputFormat::Json => {
            let body = serde_json::json!({
                "run": run.as_ref().map(RunDisplay::from),
                "listings": listings,
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }

    Ok(())
}
