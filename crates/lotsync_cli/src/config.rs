//! Configuration file support for lotsync.
//!
//! Configuration is loaded with the following precedence (highest to lowest):
//! 1. CLI flags
//! 2. Environment variables (prefixed with `LOTSYNC_`, `__` between sections,
//!    e.g., `LOTSYNC_UPSTREAM__BASE_URL`)
//! 3. Config file (~/.config/lotsync/config.toml or ./lotsync.toml)
//! 4. Built-in defaults
//!
//! The database URL defaults to `sqlite://~/.local/state/lotsync/lotsync.db` on Linux
//! (using the XDG state directory) if not explicitly configured.
//!
//! Example config file:
//! ```toml
//! log_format = "json"  # or use LOTSYNC_LOG_FORMAT
//!
//! [database]
//! url = "sqlite://~/.local/state/lotsync/lotsync.db"  # optional, this is the default
//!
//! [upstream]
//! base_url = "https://api.example.com/v1/listings"
//! token = "..."  # or use LOTSYNC_UPSTREAM__TOKEN env var
//!
//! [engine]
//! page_size = 100
//! fetch_concurrency = 4
//! rate_per_second = 10
//! empty_page_threshold = 25
//! completion_watermark = 0.99
//! expected_total = 192800
//!
//! [watchdog]
//! tick_interval_secs = 10
//! resync_interval_secs = 86400
//! ```

use std::path::PathBuf;

use config::{Config as ConfigBuilder, ConfigError, Environment, File, FileFormat};
use directories::ProjectDirs;
use lotsync::sync::{EngineConfig, WatchdogConfig};
use lotsync::upstream::UpstreamConfig;
use serde::Deserialize;

const LOCAL_CONFIG_FILE: &str = "lotsync.toml";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Upstream listing API.
    pub upstream: UpstreamConfig,
    /// Engine tuning: pools, batching, completion policy, retries.
    pub engine: EngineConfig,
    /// Watchdog timing.
    pub watchdog: WatchdogConfig,
    /// Log output format.
    pub log_format: LogFormat,
}

/// Database configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database connection URL.
    /// Supports sqlite:// and postgres:// schemes.
    /// Defaults to `sqlite://~/.local/state/lotsync/lotsync.db` if not specified.
    pub url: Option<String>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Format named by `LOTSYNC_LOG_FORMAT`, for logging set up before (or
    /// without) a loaded configuration.
    pub fn from_env() -> Self {
        Self::parse(std::env::var("LOTSYNC_LOG_FORMAT").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Text,
        }
    }
}

impl Config {
    /// Load configuration using the config crate's layered approach.
    ///
    /// Sources are loaded in order (later sources override earlier):
    /// 1. Built-in defaults
    /// 2. XDG config file (~/.config/lotsync/config.toml)
    /// 3. Local config file (./lotsync.toml)
    /// 4. Environment variables with LOTSYNC_ prefix
    ///
    /// A malformed file or a value of the wrong type is an error rather than
    /// a silent fallback to defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(config_path) = Self::default_config_path()
            && config_path.exists()
        {
            builder = builder.add_source(
                File::from(config_path)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        // Local config file (higher priority than XDG)
        let local_config = PathBuf::from(LOCAL_CONFIG_FILE);
        if local_config.exists() {
            builder = builder.add_source(
                File::from(local_config)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        // e.g., LOTSYNC_ENGINE__PAGE_SIZE -> engine.page_size
        builder
            .add_source(environment())
            .build()?
            .try_deserialize::<Config>()
    }

    /// Get the database URL, falling back to the default state directory path.
    ///
    /// The `mode=rwc` parameter enables read-write access and creates the file
    /// if it doesn't exist.
    pub fn database_url(&self) -> Option<String> {
        self.database.url.clone().or_else(|| {
            Self::default_state_dir().map(|state_dir| {
                let db_path = state_dir.join("lotsync.db");
                format!("sqlite://{}?mode=rwc", db_path.display())
            })
        })
    }

    /// Get the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "lotsync").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the default state directory path.
    ///
    /// On Linux, this is `$XDG_STATE_HOME/lotsync` or `~/.local/state/lotsync`.
    /// On macOS/Windows, falls back to the data directory.
    pub fn default_state_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "lotsync").map(|dirs| {
            // state_dir() returns None on macOS/Windows, fall back to data_dir
            dirs.state_dir()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| dirs.data_dir().to_path_buf())
        })
    }
}

fn environment() -> Environment {
    Environment::with_prefix("LOTSYNC")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
