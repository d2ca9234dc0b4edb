//! lotsync CLI - replicate a paginated vehicle-listing API into a local database.

mod commands;
mod config;
mod progress;
mod shutdown;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use console::Term;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::commands::shared::OutputFormat;
use crate::config::LogFormat;

#[derive(Parser)]
#[command(name = "lotsync")]
#[command(version)]
#[command(about = "Replicate an upstream vehicle-listing API into a local database")]
#[command(
    long_about = "lotsync pages through an upstream listing API, writes changed records \
into a local database, and checkpoints its progress so that an interrupted run can be \
resumed. The watch command keeps a run moving by resuming yielded, failed, or stalled runs."
)]
#[command(after_long_help = r#"EXAMPLES
    Apply the database schema:
        $ lotsync migrate up

    Resume (or start) a run and keep going until it finishes:
        $ lotsync run --follow

    Start over from page 1:
        $ lotsync run --fresh

    Supervise runs in the foreground:
        $ lotsync watch

    Show the latest run as JSON:
        $ lotsync status -o json

CONFIGURATION
    lotsync reads configuration from:
      1. ~/.config/lotsync/config.toml (or $XDG_CONFIG_HOME/lotsync/config.toml)
      2. ./lotsync.toml
      3. Environment variables (LOTSYNC_ prefix, __ between sections)
      4. .env file in current directory

ENVIRONMENT VARIABLES
    LOTSYNC_DATABASE__URL           Database connection string (default: ~/.local/state/lotsync/lotsync.db)
    LOTSYNC_UPSTREAM__BASE_URL      Listing endpoint
    LOTSYNC_UPSTREAM__TOKEN         Bearer token for the listing endpoint
    LOTSYNC_ENGINE__EXPECTED_TOTAL  Known total record count
    LOTSYNC_LOG_FORMAT              text or json
    RUST_LOG                        Log filter (default: lotsync=info,lotsync_cli=info)
"#)]
pub(crate) struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
    /// Trigger a sync invocation
    Run(RunArgs),
    /// Supervise sync runs until interrupted
    Watch,
    /// Show a sync run and the replicated listing count
    Status {
        /// Run to show (defaults to the most recently started)
        #[arg(long)]
        run_id: Option<Uuid>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
    /// Generate man page(s)
    Man {
        /// Output directory for man pages (prints to stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub(crate) enum MigrateAction {
    /// Apply all pending migrations
    Up,
    /// Rollback the last migration
    Down,
    /// Show migration status
    Status,
    /// Fresh install - drop all tables and reapply migrations
    Fresh,
}

/// Options for `lotsync run`.
#[derive(Debug, Clone, clap::Args)]
pub(crate) struct RunArgs {
    /// Start a new run from page 1 instead of resuming the latest one
    #[arg(long)]
    fresh: bool,

    /// Page to start from (only moves a resumed checkpoint forward)
    #[arg(short = 'p', long)]
    from_page: Option<u32>,

    /// Who triggered the run, recorded on the run
    #[arg(long, default_value = "cli")]
    source: String,

    /// Keep invoking until the run completes, fails, or is interrupted
    #[arg(short, long)]
    follow: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    output: OutputFormat,
}

fn init_tracing(format: LogFormat) {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("lotsync=info,lotsync_cli=info"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder
            .with_target(false)
            .with_ansi(Term::stderr().is_term())
            .init(),
    }
}

/// Create the parent directory of a SQLite database file.
fn ensure_sqlite_dir(database_url: &str) -> std::io::Result<()> {
    let Some(db_path) = database_url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    // Strip query parameters (e.g., ?mode=rwc) before path operations
    let db_path = db_path.split('?').next().unwrap_or(db_path);
    let db_path = std::path::Path::new(db_path);

    if db_path.is_relative() && !db_path.as_os_str().is_empty() {
        tracing::warn!(
            "Database path '{}' is relative - behavior depends on current directory. \
             Consider using an absolute path.",
            db_path.display()
        );
    }

    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Resolve the database URL and make sure a SQLite file can be created.
fn prepare_database(config: &config::Config) -> Result<String, Box<dyn std::error::Error>> {
    let database_url = config
        .database_url()
        .ok_or("could not determine a database URL; set LOTSYNC_DATABASE__URL")?;
    ensure_sqlite_dir(&database_url)?;
    Ok(database_url)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration (config file -> env vars -> defaults). Logging is
    // set up before a load error is reported so the error is never lost.
    let loaded = config::Config::load();
    init_tracing(match &loaded {
        Ok(config) => config.log_format,
        Err(_) => LogFormat::from_env(),
    });
    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return Err(format!("invalid configuration: {e}").into());
        }
    };

    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => commands::meta::handle_completions(shell)?,
        Commands::Man { output } => commands::meta::handle_man(output)?,
        Commands::Migrate { action } => {
            let database_url = prepare_database(&config)?;
            commands::migrate::handle_migrate(action, &database_url).await?;
        }
        Commands::Run(args) => {
            let database_url = prepare_database(&config)?;
            let shutdown = shutdown::setup_shutdown_handler();
            commands::run::handle_run(args, &config, &database_url, shutdown).await?;
        }
        Commands::Watch => {
            let database_url = prepare_database(&config)?;
            let shutdown = shutdown::setup_shutdown_handler();
            commands::watch::handle_watch(&config, &database_url, shutdown).await?;
        }
        Commands::Status { run_id, output } => {
            let database_url = prepare_database(&config)?;
            commands::status::handle_status(run_id, output, &database_url).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_defaults_resume_with_cli_source() {
        let cli = Cli::try_parse_from(["lotsync", "run"]).expect("parse");
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(!args.fresh);
        assert!(!args.follow);
        assert_eq!(args.source, "cli");
        assert_eq!(args.from_page, None);
    }

    #[test]
    fn run_accepts_fresh_and_start_page() {
        let cli = Cli::try_parse_from([
            "lotsync", "run", "--fresh", "--from-page", "40", "--follow", "-o", "json",
        ])
        .expect("parse");
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.fresh);
        assert!(args.follow);
        assert_eq!(args.from_page, Some(40));
        assert!(matches!(args.output, OutputFormat::Json));
    }

    #[test]
    fn status_rejects_malformed_run_id() {
        assert!(Cli::try_parse_from(["lotsync", "status", "--run-id", "nope"]).is_err());
    }

    #[test]
    fn non_sqlite_urls_need_no_directory() {
        ensure_sqlite_dir("postgres://localhost/lotsync").expect("noop");
    }
}
