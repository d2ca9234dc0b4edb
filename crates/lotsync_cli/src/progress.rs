//! Progress reporting for CLI commands.

mod logging;

pub(crate) use logging::LoggingReporter;

use lotsync::sync::ProgressCallback;

/// A progress callback that routes every engine event to tracing.
pub(crate) fn logging_callback() -> ProgressCallback {
    let reporter = LoggingReporter::new();
    Box::new(move |event| reporter.handle(event))
}
