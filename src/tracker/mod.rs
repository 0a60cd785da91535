//! Job progress tracker.
//!
//! Drives the 1 Hz polling loop against a submitted optimization job and owns
//! its observable state machine. Staleness and transport failures escalate to
//! the advisory Stuck state; only Completed, Failed and Cancelled are
//! terminal. The snapshot channel closes after the terminal snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::{JobHandle, ProgressReport, StructuringEngine};

/// Cadence of progress queries while Polling.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Unchanged polls required before the job is considered stuck (strictly
/// greater; the elapsed-time condition below must hold as well).
pub const STUCK_POLL_THRESHOLD: u32 = 30;
/// Minimum wall-clock time since the last observed change before stuck.
pub const STUCK_WINDOW: Duration = Duration::from_secs(30);
/// Consecutive transport failures before the tracker gives up confirming
/// progress and reports Stuck. The job may still be running server-side.
pub const QUERY_FAILURE_THRESHOLD: u32 = 15;
/// How long a just-completed job stays visible before the stream terminates.
pub const COMPLETION_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Polling,
    Completed,
    Stuck,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Observable snapshot of one optimization job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub status: JobStatus,
    pub progress_percent: u8,
    pub phase: String,
    pub message: String,
    pub last_change_at: DateTime<Utc>,
    pub consecutive_unchanged_polls: u32,
}

impl JobRun {
    /// State before any job has been submitted.
    pub fn idle() -> Self {
        Self {
            status: JobStatus::Idle,
            progress_percent: 0,
            phase: String::new(),
            message: String::new(),
            last_change_at: Utc::now(),
            consecutive_unchanged_polls: 0,
        }
    }

    fn starting() -> Self {
        Self {
            status: JobStatus::Polling,
            progress_percent: 0,
            phase: "Initializing".to_string(),
            message: "Starting optimization...".to_string(),
            last_change_at: Utc::now(),
            consecutive_unchanged_polls: 0,
        }
    }
}

enum TrackerCommand {
    Refresh,
    Cancel(String),
}

/// Control handle for a running tracker task
#[derive(Clone)]
pub struct TrackerControl {
    tx: mpsc::UnboundedSender<TrackerCommand>,
}

impl TrackerControl {
    /// Clear the stuck flag and the unchanged-poll counter. Does not touch
    /// the underlying job.
    pub fn refresh(&self) {
        let _ = self.tx.send(TrackerCommand::Refresh);
    }

    /// Terminate tracking with a Cancelled snapshot. Any in-flight query
    /// response is discarded and no further polls are issued.
    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.tx.send(TrackerCommand::Cancel(reason.into()));
    }
}

/// A started tracking session: the snapshot stream plus its control handle
pub struct TrackedJob {
    pub snapshots: mpsc::UnboundedReceiver<JobRun>,
    pub control: TrackerControl,
}

pub struct JobTracker {
    engine: Arc<dyn StructuringEngine>,
}

impl JobTracker {
    pub fn new(engine: Arc<dyn StructuringEngine>) -> Self {
        Self { engine }
    }

    /// Start polling the given job. The returned stream yields a snapshot per
    /// poll and closes after a terminal one.
    pub fn start(&self, job: JobHandle) -> TrackedJob {
        let (snap_tx, snap_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let engine = self.engine.clone();
        tokio::spawn(async move {
            poll_loop(engine, job, snap_tx, cmd_rx).await;
        });

        TrackedJob {
            snapshots: snap_rx,
            control: TrackerControl { tx: cmd_tx },
        }
    }
}

async fn poll_loop(
    engine: Arc<dyn StructuringEngine>,
    job: JobHandle,
    tx: mpsc::UnboundedSender<JobRun>,
    mut cmd_rx: mpsc::UnboundedReceiver<TrackerCommand>,
) {
    let mut run = JobRun::starting();
    let mut last_change = Instant::now();
    let mut query_failures: u32 = 0;

    let _ = tx.send(run.clone());

    let mut ticker = interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'poll: loop {
        tokio::select! {
            biased;
            Some(cmd) = cmd_rx.recv() => {
                match cmd {
                    TrackerCommand::Cancel(reason) => {
                        emit_cancelled(&tx, &mut run, reason);
                        break 'poll;
                    }
                    TrackerCommand::Refresh => {
                        apply_refresh(&mut run, &mut query_failures);
                        continue 'poll;
                    }
                }
            }
            _ = ticker.tick() => {}
        }

        // Cancellation must win against an in-flight query: the eventual
        // response is dropped with the future.
        let result = tokio::select! {
            biased;
            Some(cmd) = cmd_rx.recv() => {
                match cmd {
                    TrackerCommand::Cancel(reason) => {
                        emit_cancelled(&tx, &mut run, reason);
                        break 'poll;
                    }
                    TrackerCommand::Refresh => {
                        apply_refresh(&mut run, &mut query_failures);
                        continue 'poll;
                    }
                }
            }
            result = engine.query_progress(&job) => result,
        };

        let report = match result {
            Ok(report) => {
                query_failures = 0;
                report
            }
            Err(e) => {
                query_failures += 1;
                warn!(
                    job_id = %job.job_id,
                    failures = query_failures,
                    "Progress query failed: {e:#}"
                );
                if query_failures >= QUERY_FAILURE_THRESHOLD && run.status == JobStatus::Polling {
                    run.status = JobStatus::Stuck;
                    warn!(
                        job_id = %job.job_id,
                        "No confirmation from engine after {query_failures} failed queries, marking stuck"
                    );
                }
                let _ = tx.send(run.clone());
                continue 'poll;
            }
        };

        if report.error {
            // Server-reported failure is terminal and verbatim. Never
            // synthesize a progress value from a failed response.
            run.status = JobStatus::Failed;
            run.phase = report.phase;
            run.message = report.message;
            info!(job_id = %job.job_id, "Job failed: {}", run.message);
            let _ = tx.send(run.clone());
            break 'poll;
        }

        apply_report(&mut run, &mut last_change, report);

        if run.status == JobStatus::Stuck {
            debug!(
                job_id = %job.job_id,
                unchanged = run.consecutive_unchanged_polls,
                "Job shows no progress"
            );
        }

        if run.progress_percent >= 100 {
            run.status = JobStatus::Completed;
            info!(job_id = %job.job_id, "Job completed");
            let _ = tx.send(run.clone());

            // Hold the completed state visible before terminating the
            // stream. No polling happens during the grace window.
            tokio::select! {
                biased;
                Some(TrackerCommand::Cancel(_)) = cmd_rx.recv() => {}
                _ = sleep(COMPLETION_GRACE) => {}
            }
            break 'poll;
        }

        let _ = tx.send(run.clone());
    }
}

fn apply_refresh(run: &mut JobRun, query_failures: &mut u32) {
    if run.status == JobStatus::Stuck {
        run.status = JobStatus::Polling;
    }
    run.consecutive_unchanged_polls = 0;
    *query_failures = 0;
}

fn emit_cancelled(tx: &mpsc::UnboundedSender<JobRun>, run: &mut JobRun, reason: String) {
    run.status = JobStatus::Cancelled;
    run.message = reason;
    info!("Job tracking cancelled: {}", run.message);
    let _ = tx.send(run.clone());
}

/// Fold one successful progress response into the run state.
fn apply_report(run: &mut JobRun, last_change: &mut Instant, report: ProgressReport) {
    let incoming = report.progress.clamp(0, 100) as u8;

    // A percent below the recorded one is a stale duplicate from out-of-order
    // delivery: the recorded percent never regresses, but the text may still
    // feed the staleness clock.
    let percent_advanced = incoming > run.progress_percent;
    let text_changed = report.message != run.message || report.phase != run.phase;

    if percent_advanced {
        run.progress_percent = incoming;
    }
    if text_changed {
        run.phase = report.phase;
        run.message = report.message;
    }

    if percent_advanced || text_changed {
        run.consecutive_unchanged_polls = 0;
        *last_change = Instant::now();
        run.last_change_at = Utc::now();
        if run.status == JobStatus::Stuck {
            run.status = JobStatus::Polling;
        }
    } else {
        run.consecutive_unchanged_polls += 1;
        if run.status == JobStatus::Polling
            && run.consecutive_unchanged_polls > STUCK_POLL_THRESHOLD
            && last_change.elapsed() > STUCK_WINDOW
        {
            run.status = JobStatus::Stuck;
        }
    }
}
