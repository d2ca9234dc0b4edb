use lotsync::sync::SyncProgress;

/// Logging reporter using tracing for structured output.
pub struct LoggingReporter;

impl LoggingReporter {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, event: SyncProgress) {
        match event {
            SyncProgress::RunStarted {
                run_id,
                source,
                start_page,
                resumed,
            } => {
                tracing::info!(%run_id, source = %source, start_page, resumed, "Run started");
            }

            SyncProgress::PageFetchRetry {
                page,
                retry_after_ms,
                attempt,
                error,
            } => {
                tracing::debug!(page, retry_after_ms, attempt, error = %error, "Page fetch retry");
            }

            SyncProgress::BatchWritten {
                page,
                count,
                rows_affected,
            } => {
                tracing::trace!(page, count, rows_affected, "Batch written");
            }

            SyncProgress::PageCompleted {
                page,
                fetched,
                written,
                unchanged,
                malformed,
                records_processed,
                elapsed_ms,
            } => {
                tracing::info!(
                    page,
                    fetched,
                    written,
                    unchanged,
                    malformed,
                    records_processed,
                    elapsed_ms,
                    "Page synced"
                );
            }

            SyncProgress::PageSkipped {
                page,
                kind,
                error,
                error_count,
            } => {
                tracing::warn!(page, kind = %kind, error_count, error = %error, "Page skipped");
            }

            SyncProgress::RunYielded {
                run_id,
                reason,
                current_page,
                records_processed,
            } => {
                tracing::info!(%run_id, reason = %reason, current_page, records_processed, "Run yielded");
            }

            SyncProgress::RunFinished {
                run_id,
                status,
                records_processed,
                records_written,
                elapsed_ms,
            } => {
                tracing::info!(
                    %run_id,
                    status = %status,
                    records_processed,
                    records_written,
                    elapsed_ms,
                    "Run finished"
                );
            }

            SyncProgress::StallDetected { run_id, idle } => {
                tracing::warn!(%run_id, idle_secs = idle.as_secs(), "Stalled run detected");
            }

            SyncProgress::ResumeScheduled { run_id, from_page } => {
                tracing::info!(%run_id, from_page, "Resume scheduled");
            }

            SyncProgress::FreshRunScheduled { previous } => {
                tracing::info!(previous = ?previous, "Fresh run scheduled");
            }

            SyncProgress::AutoResumeSuspended {
                run_id,
                connectivity_failures,
            } => {
                tracing::error!(
                    %run_id,
                    connectivity_failures,
                    "Auto-resume suspended; check upstream connectivity and resume manually"
                );
            }

            SyncProgress::Warning { message } => {
                tracing::warn!("{}", message);
            }

            _ => {}
        }
    }
}

impl Default for LoggingReporter {
    fn default() -> Self {
        Self::new()
    }
}
