//! Stall detection and auto-resume.
//!
//! The decision of what to do with the latest run is the pure function
//! [`evaluate`]; [`Watchdog`] applies it on a fixed tick and owns the single
//! in-flight invocation it may have launched.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::coordinator::{SyncEngine, wait_for_shutdown};
use super::errors::Result;
use super::progress::SyncProgress;
use super::run::SyncRun;
use super::types::{EngineConfig, TriggerRequest, TriggerResponse, WatchdogConfig};
use crate::entity::run_status::RunStatus;
use crate::store::{ListingStore, ProgressStore, STALLED_KIND};
use crate::upstream::UpstreamSource;

const WATCHDOG_SOURCE: &str = "watchdog";

/// Thresholds the watchdog decides with.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogPolicy {
    pub stall_threshold: Duration,
    pub early_grace: Duration,
    pub standard_grace: Duration,
    pub connectivity_grace: Duration,
    /// Failed runs below this fraction are resumed after the early grace.
    pub early_fraction: f64,
    pub max_connectivity_resumes: u32,
    pub resync_interval: Option<Duration>,
}

impl WatchdogPolicy {
    pub fn new(engine: &EngineConfig, config: &WatchdogConfig) -> Self {
        Self {
            stall_threshold: engine.stall_threshold(),
            early_grace: Duration::from_secs(config.early_grace_secs),
            standard_grace: Duration::from_secs(config.standard_grace_secs),
            connectivity_grace: Duration::from_secs(config.connectivity_grace_secs),
            early_fraction: config.early_fraction,
            max_connectivity_resumes: config.max_connectivity_resumes,
            resync_interval: config.resync_interval_secs.map(Duration::from_secs),
        }
    }

    /// Grace period before a failed run is resumed.
    fn grace_for(&self, run: &SyncRun) -> Duration {
        if run.last_error_kind.as_deref() == Some(STALLED_KIND) {
            Duration::ZERO
        } else if run.is_connectivity_failure() {
            self.connectivity_grace
        } else if run.records_processed == 0
            || run
                .fraction_complete()
                .is_some_and(|f| f < self.early_fraction)
        {
            self.early_grace
        } else {
            self.standard_grace
        }
    }
}

/// What the watchdog should do about the latest run.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchdogAction {
    Nothing,
    /// A resume is due once `remaining` has passed.
    Wait { remaining: Duration },
    /// No progress for longer than the stall threshold.
    MarkStalled {
        run_id: Uuid,
        revision: i64,
        idle: Duration,
    },
    Resume { run_id: Uuid },
    StartFresh { previous: Option<Uuid> },
    /// Too many consecutive connectivity failures; an operator has to step in.
    GiveUp {
        run_id: Uuid,
        connectivity_failures: u32,
    },
}

/// Decide what to do with `run` at `now`.
pub fn evaluate(
    run: Option<&SyncRun>,
    now: DateTime<Utc>,
    policy: &WatchdogPolicy,
    in_flight: bool,
) -> WatchdogAction {
    if in_flight {
        return WatchdogAction::Nothing;
    }
    let Some(run) = run else {
        return WatchdogAction::StartFresh { previous: None };
    };

    let idle = run.idle_for(now);
    let resume_after = |grace: Duration| {
        if idle >= grace {
            WatchdogAction::Resume { run_id: run.run_id }
        } else {
            WatchdogAction::Wait {
                remaining: grace - idle,
            }
        }
    };

    match run.status {
        RunStatus::Idle => WatchdogAction::Resume { run_id: run.run_id },
        RunStatus::Completed => {
            let since = run.completed_at.unwrap_or(run.last_activity_at);
            let elapsed = (now - since).to_std().unwrap_or_default();
            match policy.resync_interval {
                Some(interval) if elapsed >= interval => WatchdogAction::StartFresh {
                    previous: Some(run.run_id),
                },
                _ => WatchdogAction::Nothing,
            }
        }
        RunStatus::Running if run.metadata.last_yield_reason.is_some() => {
            resume_after(policy.early_grace)
        }
        RunStatus::Running if idle >= policy.stall_threshold => WatchdogAction::MarkStalled {
            run_id: run.run_id,
            revision: run.revision,
            idle,
        },
        RunStatus::Running => WatchdogAction::Nothing,
        RunStatus::Failed
            if run.is_connectivity_failure()
                && run.metadata.connectivity_failures >= policy.max_connectivity_resumes =>
        {
            WatchdogAction::GiveUp {
                run_id: run.run_id,
                connectivity_failures: run.metadata.connectivity_failures,
            }
        }
        RunStatus::Failed => resume_after(policy.grace_for(run)),
    }
}

/// Periodically inspects the latest run and resumes it when needed.
///
/// At most one invocation launched by the watchdog runs at a time. An
/// invocation that yields with `should_continue` is continued on the next
/// tick without waiting for any grace period.
pub struct Watchdog<S, D> {
    engine: Arc<SyncEngine<S, D>>,
    policy: WatchdogPolicy,
    tick_interval: Duration,
    in_flight: Option<JoinHandle<Result<TriggerResponse>>>,
    suspended_for: Option<Uuid>,
}

impl<S, D> Watchdog<S, D>
where
    S: UpstreamSource + 'static,
    D: ListingStore + ProgressStore + 'static,
{
    pub fn new(engine: Arc<SyncEngine<S, D>>, config: &WatchdogConfig) -> Self {
        let policy = WatchdogPolicy::new(engine.config(), config);
        Self {
            engine,
            policy,
            tick_interval: config.tick_interval(),
            in_flight: None,
            suspended_for: None,
        }
    }

    pub fn policy(&self) -> &WatchdogPolicy {
        &self.policy
    }

    /// Whether an invocation launched by the watchdog is still running.
    pub fn is_busy(&self) -> bool {
        self.in_flight.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn shutting_down(&self) -> bool {
        self.engine.shutdown_flag().load(Ordering::Relaxed)
    }

    /// One watchdog pass. Returns the action taken.
    pub async fn tick(&mut self) -> Result<WatchdogAction> {
        if self.is_busy() {
            return Ok(WatchdogAction::Nothing);
        }
        if let Some(response) = self.reap().await
            && response.should_continue
            && response.status == RunStatus::Running
            && !self.shutting_down()
            && let Some(run_id) = response.run_id
        {
            debug!(%run_id, current_page = response.current_page, "Continuing yielded run");
            self.launch(TriggerRequest::resume(WATCHDOG_SOURCE));
            return Ok(WatchdogAction::Resume { run_id });
        }

        let store = self.engine.store();
        let run = store.latest_run().await?;
        let mut action = evaluate(run.as_ref(), Utc::now(), &self.policy, false);

        if let WatchdogAction::MarkStalled {
            run_id,
            revision,
            idle,
        } = action
        {
            let idle_since = run.as_ref().map_or_else(Utc::now, |r| r.last_activity_at);
            if !store.mark_stalled(run_id, revision, idle_since).await? {
                debug!(%run_id, "Run moved on before it could be marked stalled");
                return Ok(WatchdogAction::Nothing);
            }
            warn!(%run_id, idle_secs = idle.as_secs(), "Run stalled, marked failed");
            self.engine
                .report(SyncProgress::StallDetected { run_id, idle });

            let run = store.latest_run().await?;
            action = evaluate(run.as_ref(), Utc::now(), &self.policy, false);
            self.apply(&action, run.as_ref());
            return Ok(action);
        }

        self.apply(&action, run.as_ref());
        Ok(action)
    }

    fn apply(&mut self, action: &WatchdogAction, run: Option<&SyncRun>) {
        match action {
            WatchdogAction::Nothing | WatchdogAction::MarkStalled { .. } => {}
            WatchdogAction::Wait { remaining } => {
                debug!(remaining_secs = remaining.as_secs(), "Resume not due yet");
            }
            WatchdogAction::Resume { run_id } => {
                self.suspended_for = None;
                let from_page = run.map_or(1, |r| r.current_page);
                info!(%run_id, from_page, "Scheduling resume");
                self.engine.report(SyncProgress::ResumeScheduled {
                    run_id: *run_id,
                    from_page,
                });
                self.launch(TriggerRequest::resume(WATCHDOG_SOURCE));
            }
            WatchdogAction::StartFresh { previous } => {
                self.suspended_for = None;
                info!(previous = ?previous, "Scheduling fresh run");
                self.engine
                    .report(SyncProgress::FreshRunScheduled { previous: *previous });
                self.launch(TriggerRequest::fresh(WATCHDOG_SOURCE));
            }
            WatchdogAction::GiveUp {
                run_id,
                connectivity_failures,
            } => {
                if self.suspended_for == Some(*run_id) {
                    return;
                }
                self.suspended_for = Some(*run_id);
                error!(
                    %run_id,
                    connectivity_failures,
                    "Upstream unreachable across repeated resumes, auto-resume suspended"
                );
                self.engine.report(SyncProgress::AutoResumeSuspended {
                    run_id: *run_id,
                    connectivity_failures: *connectivity_failures,
                });
            }
        }
    }

    fn launch(&mut self, request: TriggerRequest) {
        let engine = Arc::clone(&self.engine);
        self.in_flight = Some(tokio::spawn(async move { engine.trigger(request).await }));
    }

    /// Collect a finished invocation, logging its outcome.
    async fn reap(&mut self) -> Option<TriggerResponse> {
        let handle = self.in_flight.take()?;
        match handle.await {
            Ok(Ok(response)) => {
                debug!(
                    run_id = ?response.run_id,
                    status = %response.status,
                    should_continue = response.should_continue,
                    "Scheduled invocation returned"
                );
                Some(response)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Scheduled invocation failed");
                None
            }
            Err(e) => {
                error!(error = %e, "Scheduled invocation panicked");
                None
            }
        }
    }

    /// Wait for the in-flight invocation, if any.
    pub async fn drain(&mut self) -> Option<TriggerResponse> {
        self.reap().await
    }

    /// Tick until the engine's shutdown flag is raised, then wait for the
    /// in-flight invocation to checkpoint and return.
    pub async fn run(mut self) -> Result<()> {
        let shutdown = Arc::clone(self.engine.shutdown_flag());
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            tick_secs = self.tick_interval.as_secs(),
            stall_threshold_secs = self.policy.stall_threshold.as_secs(),
            "Watchdog started"
        );

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&shutdown) => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.tick().await {
                warn!(error = %e, "Watchdog tick failed");
            }
        }

        if self.in_flight.is_some() {
            info!("Waiting for in-flight invocation to checkpoint");
        }
        self.drain().await;
        info!("Watchdog stopped");
        Ok(())
    }
}
