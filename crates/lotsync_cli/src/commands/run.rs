use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use lotsync::sync::{ErrorKind, TriggerRequest, TriggerResponse};

use crate::RunArgs;
use crate::commands::shared::{InvocationDisplay, OutputFormat, build_engine, print_rows};
use crate::config::Config;

/// Build the trigger request from CLI flags.
fn request_from_args(args: &RunArgs) -> TriggerRequest {
    TriggerRequest {
        resume: !args.fresh,
        from_page: args.from_page,
        source: args.source.clone(),
    }
}

/// Whether another invocation should follow `response`.
fn should_follow(response: &TriggerResponse, follow: bool, shutdown: &AtomicBool) -> bool {
    follow && response.should_continue && !shutdown.load(Ordering::Acquire)
}

/// Handle `lotsync run`: one invocation, or until done with `--follow`.
pub(crate) async fn handle_run(
    args: RunArgs,
    config: &Config,
    database_url: &str,
    shutdown: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = build_engine(config, database_url, Arc::clone(&shutdown)).await?;

    let mut request = request_from_args(&args);
    let mut invocations = Vec::new();
    loop {
        let response = engine.trigger(request).await?;
        let follow = should_follow(&response, args.follow, &shutdown);
        invocations.push(response);
        if !follow {
            break;
        }
        request = TriggerRequest::resume(args.source.clone());
    }

    let rows = invocations.iter().map(InvocationDisplay::from).collect();
    print_rows(rows, args.output)?;

    match invocations.last() {
        Some(last) if last.error_kind.as_deref() == Some(ErrorKind::Connectivity.as_str()) => {
            Err(format!(
                "upstream unreachable: {}",
                last.error.as_deref().unwrap_or("no detail")
            )
            .into())
        }
        Some(last) if !last.success => Err(format!(
            "run failed: {}",
            last.error.as_deref().unwrap_or("no detail")
        )
        .into()),
        _ => Ok(()),
    }
}
