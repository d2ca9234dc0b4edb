use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use lotsync::sync::{SyncEngine, SyncRun, TriggerResponse};
use lotsync::upstream::HttpAuctionSource;
use lotsync::{DbStore, connect_and_migrate};

use crate::config::Config;
use crate::progress;

/// Output format for command results.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub(crate) enum OutputFormat {
    /// Display as a formatted table (default)
    #[default]
    Table,
    /// Display as JSON
    Json,
}

pub(crate) type Engine = SyncEngine<HttpAuctionSource, DbStore>;

/// Connect, migrate, and open the database-backed store.
pub(crate) async fn open_store(database_url: &str) -> Result<Arc<DbStore>, Box<dyn std::error::Error>> {
    let db = connect_and_migrate(database_url).await?;
    Ok(Arc::new(DbStore::new(Arc::new(db))))
}

/// Build an engine wired to the configured upstream, the database, the
/// shutdown flag and the logging reporter.
pub(crate) async fn build_engine(
    config: &Config,
    database_url: &str,
    shutdown: Arc<AtomicBool>,
) -> Result<Engine, Box<dyn std::error::Error>> {
    let store = open_store(database_url).await?;
    let source = HttpAuctionSource::new(config.upstream.clone(), config.engine.request_timeout())?;
    tracing::debug!(base_url = %source.config().base_url, "Upstream configured");

    Ok(SyncEngine::new(Arc::new(source), store, config.engine.clone())
        .with_shutdown_flag(shutdown)
        .with_progress(progress::logging_callback()))
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn or_dash(value: Option<String>) -> String {
    value.unwrap_or_else(|| "-".to_string())
}

/// One invocation's outcome, as printed by `lotsync run`.
#[derive(Debug, Clone, serde::Serialize, tabled::Tabled)]
pub(crate) struct InvocationDisplay {
    #[tabled(rename = "Run")]
    pub run_id: String,
    #[tabled(rename = "Status")]
    pub status: String,
    #[tabled(rename = "Next Page")]
    pub current_page: u32,
    #[tabled(rename = "Processed")]
    pub records_processed: u64,
    #[tabled(rename = "Written")]
    pub records_written: u64,
    #[tabled(rename = "Continue")]
    pub should_continue: bool,
    #[tabled(rename = "Note")]
    pub note: String,
}

impl From<&TriggerResponse> for InvocationDisplay {
    fn from(response: &TriggerResponse) -> Self {
        let note = match (&response.error_kind, &response.error, &response.message) {
            (Some(kind), Some(error), _) => format!("{kind}: {error}"),
            (_, Some(error), _) => error.clone(),
            (_, _, Some(message)) => message.clone(),
            _ => String::new(),
        };
        Self {
            run_id: or_dash(response.run_id.map(|id| id.to_string())),
            status: response.status.to_string(),
            current_page: response.current_page,
            records_processed: response.records_processed,
            records_written: response.records_written,
            should_continue: response.should_continue,
            note,
        }
    }
}

/// A persisted run, as printed by `lotsync status`.
#[derive(Debug, Clone, serde::Serialize, tabled::Tabled)]
pub(crate) struct RunDisplay {
    #[tabled(rename = "Run")]
    pub run_id: String,
    #[tabled(rename = "Status")]
    pub status: String,
    #[tabled(rename = "Next Page")]
    pub current_page: u32,
    #[tabled(rename = "Processed")]
    pub records_processed: u64,
    #[tabled(rename = "Progress")]
    pub progress: String,
    #[tabled(rename = "Errors")]
    pub error_count: u32,
    #[tabled(rename = "Resumes")]
    pub resume_count: u32,
    #[tabled(rename = "Last Activity")]
    pub last_activity: String,
    #[tabled(rename = "Last Error")]
    pub last_error: String,
}

impl From<&SyncRun> for RunDisplay {
    fn from(run: &SyncRun) -> Self {
        let progress = match (run.fraction_complete(), run.expected_total) {
            (Some(fraction), Some(total)) => {
                format!("{:.1}% of {total}", fraction * 100.0)
            }
            _ => "-".to_string(),
        };
        let last_error = match (&run.last_error_kind, &run.last_error) {
            (Some(kind), Some(error)) => format!("{kind}: {error}"),
            (None, Some(error)) => error.clone(),
            _ => "-".to_string(),
        };
        Self {
            run_id: run.run_id.to_string(),
            status: run.status.to_string(),
            current_page: run.current_page,
            records_processed: run.records_processed,
            progress,
            error_count: run.error_count,
            resume_count: run.resume_count,
            last_activity: format_time(Some(run.last_activity_at)),
            last_error,
        }
    }
}

/// Print rows as a rounded table or pretty JSON.
pub(crate) fn print_rows<T>(rows: Vec<T>, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>>
where
    T: serde::Serialize + tabled::Tabled,
{
    match format {
        OutputFormat::Table => {
            let mut table = tabled::Table::new(rows);
            table.with(tabled::settings::Style::rounded());
            println!("{}", table);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }
    Ok(())
}
