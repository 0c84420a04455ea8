//! Periodic orchestration and archive loops.
//!
//! One pass routes triage candidates with bounded concurrency, retries
//! pending replies and owed guest notices, then sends completion notices. Archival and retention
//! run on their own, slower interval.

use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::Result;

use super::triage::TriageOutcome;
use super::Engine;

/// Counters from one orchestration pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Tasks whose next party was notified.
    pub routed: usize,
    /// Tasks whose routing failed this pass.
    pub failed: usize,
    /// Pending replies resolved by the retry sweep.
    pub replies_retried: usize,
    /// Owed guest updates and info requests delivered.
    pub guest_notices: usize,
    /// Completion notices delivered.
    pub completions: usize,
}

/// Run one orchestration pass.
///
/// # Errors
///
/// Returns `AppError::Db` if a candidate query fails. Failures on single
/// tasks are logged and left for the next pass.
pub async fn run_pass(engine: &Engine) -> Result<PassReport> {
    let ctx = &engine.ctx;
    let candidates = ctx.tasks.triage_candidates(ctx.max_attempts()).await?;
    debug!(candidates = candidates.len(), "triage candidates loaded");

    let outcomes: Vec<Option<TriageOutcome>> = stream::iter(candidates)
        .map(|task| async move {
            match engine.triage.route_task(&task).await {
                Ok(outcome) => Some(outcome),
                Err(err) => {
                    warn!(task_id = %task.id, %err, "triage failed");
                    None
                }
            }
        })
        .buffer_unordered(ctx.config.orchestration.max_concurrent_tasks)
        .collect()
        .await;

    let mut report = PassReport::default();
    for outcome in outcomes {
        match outcome {
            Some(TriageOutcome::Routed { .. }) => report.routed += 1,
            Some(TriageOutcome::Failed) | None => report.failed += 1,
            Some(_) => {}
        }
    }

    report.replies_retried = engine.replies.retry_pending().await?;
    report.guest_notices = engine.guest_notices.run().await?;
    report.completions = engine.completion.run().await?;
    Ok(report)
}

/// Spawn the periodic orchestration loop.
#[must_use]
pub fn spawn_orchestration_task(engine: Engine, cancel: CancellationToken) -> JoinHandle<()> {
    let period = Duration::from_secs(engine.ctx.config.orchestration.interval_seconds);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("orchestration loop shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let span = info_span!("orchestration_pass");
                    match run_pass(&engine).instrument(span).await {
                        Ok(report) if report != PassReport::default() => {
                            info!(?report, "orchestration pass complete");
                        }
                        Ok(_) => {}
                        Err(err) => error!(%err, "orchestration pass failed"),
                    }
                }
            }
        }
    })
}

/// Spawn the archive and retention loop.
#[must_use]
pub fn spawn_archive_task(engine: Engine, cancel: CancellationToken) -> JoinHandle<()> {
    let period = Duration::from_secs(engine.ctx.config.orchestration.archive_interval_seconds);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("archive loop shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = engine.archiver.run().await {
                        error!(%err, "archive run failed");
                    }
                    if let Err(err) = engine.archiver.purge().await {
                        error!(%err, "retention purge failed");
                    }
                }
            }
        }
    })
}
