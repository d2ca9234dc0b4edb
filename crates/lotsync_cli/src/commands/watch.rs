use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use lotsync::Watchdog;

use crate::commands::shared::build_engine;
use crate::config::Config;

/// Handle `lotsync watch`: run the watchdog until Ctrl+C.
pub(crate) async fn handle_watch(
    config: &Config,
    database_url: &str,
    shutdown: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = build_engine(config, database_url, shutdown).await?;
    let watchdog = Watchdog::new(Arc::new(engine), &config.watchdog);

    tracing::info!(
        base_url = %config.upstream.base_url,
        tick_secs = config.watchdog.tick_interval_secs,
        "Watching sync runs, press Ctrl+C to stop"
    );
    watchdog.run().await?;
    Ok(())
}
