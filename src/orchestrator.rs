//! Run orchestrator.
//!
//! Thin glue over the engine boundary, the tracker and the store: submit a
//! job, follow its snapshots under a wall-clock ceiling, and on completion
//! fetch and persist the outcome. On any non-completed terminal state the
//! store is left untouched.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::engine::{JobHandle, StructuringEngine};
use crate::models::{
    CalculationRequest, GeneralSettings, MethodType, OptimizationOutcome, OptimizationSettings,
    StructureResult,
};
use crate::store::ResultStore;
use crate::tracker::{JobRun, JobStatus, JobTracker};

/// Hard ceiling on one submit+poll sequence. Independent of the tracker's
/// stuck heuristic: expiry cancels the tracker outright.
pub const JOB_DEADLINE: Duration = Duration::from_secs(300);

/// Terminal outcome of one orchestrated optimization run
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(Box<OptimizationOutcome>),
    /// The engine itself reported failure; message is verbatim.
    Failed { message: String },
    /// Caller-side ceiling or explicit cancellation. Never a server failure.
    Cancelled { reason: String },
}

pub struct RunOrchestrator {
    engine: Arc<dyn StructuringEngine>,
    store: Arc<ResultStore>,
    tracker: JobTracker,
}

impl RunOrchestrator {
    pub fn new(engine: Arc<dyn StructuringEngine>, store: Arc<ResultStore>) -> Self {
        Self {
            tracker: JobTracker::new(engine.clone()),
            engine,
            store,
        }
    }

    /// Submit an optimization job and follow it to a terminal state.
    /// Snapshots are forwarded to `watcher` when one is supplied.
    pub async fn run_optimization(
        &self,
        mut settings: OptimizationSettings,
        general: &GeneralSettings,
        watcher: Option<mpsc::UnboundedSender<JobRun>>,
    ) -> Result<RunOutcome> {
        sanitize_settings(&mut settings);
        let method = MethodType::from_optimization_method(&settings.optimization_method);

        let job = self.engine.submit_job(&settings, general).await?;
        info!(job_id = %job.job_id, method = %method, "Submitted optimization job");

        let mut tracked = self.tracker.start(job.clone());

        let tracked_to_terminal = timeout(JOB_DEADLINE, async {
            while let Some(run) = tracked.snapshots.recv().await {
                forward(&watcher, &run);
                if run.status.is_terminal() {
                    return Some(run);
                }
            }
            None
        })
        .await;

        let terminal = match tracked_to_terminal {
            Ok(terminal) => terminal,
            Err(_) => {
                let reason = format!(
                    "Optimization timed out after {} seconds",
                    JOB_DEADLINE.as_secs()
                );
                warn!(job_id = %job.job_id, "{reason}");
                tracked.control.cancel(reason.clone());
                // Drain to the Cancelled snapshot so the poll task stops
                // before we report.
                while let Some(run) = tracked.snapshots.recv().await {
                    forward(&watcher, &run);
                    if run.status.is_terminal() {
                        break;
                    }
                }
                return Ok(RunOutcome::Cancelled { reason });
            }
        };

        match terminal {
            Some(run) if run.status == JobStatus::Completed => {
                self.finalize(&job, method, general).await
            }
            Some(run) if run.status == JobStatus::Failed => Ok(RunOutcome::Failed {
                message: run.message,
            }),
            Some(run) => Ok(RunOutcome::Cancelled { reason: run.message }),
            None => Ok(RunOutcome::Cancelled {
                reason: "Job tracking ended without a terminal state".to_string(),
            }),
        }
    }

    /// Fetch the completed payload and persist it: named save (which also
    /// upserts the bounded history under the run's category), the latest
    /// optimization slot, and the working-slot advance.
    async fn finalize(
        &self,
        job: &JobHandle,
        method: MethodType,
        general: &GeneralSettings,
    ) -> Result<RunOutcome> {
        let outcome = self
            .engine
            .fetch_result(job)
            .await
            .context("Failed to fetch completed optimization result")?;

        let name = format!(
            "{} optimization {}",
            method_label(method),
            Utc::now().format("%Y-%m-%d %H:%M")
        );
        self.store
            .save(outcome.structure.clone(), name, method)?;
        self.store.set_optimization(outcome.clone())?;
        self.store.advance_current(outcome.structure.clone())?;

        info!(
            job_id = %job.job_id,
            best_strategy = %outcome.best_strategy,
            buffer_ok = outcome.structure.min_buffer_actual >= general.min_buffer,
            "Optimization result persisted"
        );
        Ok(RunOutcome::Completed(Box::new(outcome)))
    }

    /// Evaluate one explicit configuration and install it as the current
    /// working result. Also seeds the comparison history under the manual
    /// category so auto-comparison has a baseline.
    pub async fn run_calculation(&self, request: &CalculationRequest) -> Result<StructureResult> {
        let result = self.engine.calculate(request).await?;
        self.store.advance_current(result.clone())?;
        self.store.record_comparison_entry(
            result.clone(),
            "Manual calculation".to_string(),
            MethodType::Manual,
        )?;
        Ok(result)
    }
}

fn forward(watcher: &Option<mpsc::UnboundedSender<JobRun>>, run: &JobRun) {
    if let Some(tx) = watcher {
        let _ = tx.send(run.clone());
    }
}

fn method_label(method: MethodType) -> &'static str {
    match method {
        MethodType::Manual => "Manual",
        MethodType::Standard => "Classic",
        MethodType::Genetic => "Genetic",
    }
}

/// Keep the search space tractable: a wide maturity range combined with a
/// fine step explodes the combination count, so the step is clamped.
fn sanitize_settings(settings: &mut OptimizationSettings) {
    let range = settings.maturity_range[1] - settings.maturity_range[0];
    if range > 200 && settings.maturity_step < 15 {
        warn!(
            range,
            step = settings.maturity_step,
            "Large maturity range with small step, clamping step to 15"
        );
        settings.maturity_step = 15;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ProgressReport;
    use crate::models::{NpvSettings, TrancheA, TrancheB};
    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    fn general() -> GeneralSettings {
        GeneralSettings {
            start_date: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            operational_expenses: 25_000.0,
            min_buffer: 4.0,
        }
    }

    fn outcome(financing_cost: f64) -> OptimizationOutcome {
        OptimizationOutcome {
            best_strategy: "middle_weighted".to_string(),
            class_a_maturities: vec![90, 180],
            class_a_nominals: vec![500_000.0, 300_000.0],
            class_a_rates: vec![42.0, 43.5],
            class_a_reinvest: vec![40.0, 40.0],
            class_b_maturity: 200,
            class_b_rate: 0.0,
            class_b_reinvest: 38.0,
            class_b_nominal: 200_000.0,
            class_b_coupon_rate: 30.2,
            last_cash_flow_day: 190,
            additional_days: 10,
            results_by_strategy: serde_json::Map::new(),
            structure: StructureResult {
                class_a_principal: 800_000.0,
                class_a_interest: 60_000.0,
                class_b_principal: 200_000.0,
                class_b_coupon: 55_000.0,
                min_buffer_actual: 4.8,
                financing_cost,
                total_principal_paid: 1_000_000.0,
                total_loan_principal: 1_050_000.0,
                ..Default::default()
            },
        }
    }

    struct MockEngine {
        polls: Mutex<VecDeque<ProgressReport>>,
        result: Option<OptimizationOutcome>,
    }

    impl MockEngine {
        fn new(polls: Vec<ProgressReport>, result: Option<OptimizationOutcome>) -> Arc<Self> {
            Arc::new(Self {
                polls: Mutex::new(polls.into()),
                result,
            })
        }

        fn report(progress: i64, phase: &str, message: &str) -> ProgressReport {
            ProgressReport {
                progress,
                phase: phase.to_string(),
                message: message.to_string(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl StructuringEngine for MockEngine {
        async fn submit_job(
            &self,
            _settings: &OptimizationSettings,
            _general: &GeneralSettings,
        ) -> Result<JobHandle> {
            Ok(JobHandle {
                job_id: "job-42".to_string(),
            })
        }

        async fn query_progress(&self, _job: &JobHandle) -> Result<ProgressReport> {
            let mut polls = self.polls.lock();
            if polls.len() > 1 {
                Ok(polls.pop_front().unwrap())
            } else {
                Ok(polls.front().cloned().unwrap())
            }
        }

        async fn fetch_result(&self, _job: &JobHandle) -> Result<OptimizationOutcome> {
            match &self.result {
                Some(outcome) => Ok(outcome.clone()),
                None => bail!("no result staged"),
            }
        }

        async fn calculate(&self, _request: &CalculationRequest) -> Result<StructureResult> {
            Ok(outcome(11.0).structure)
        }
    }

    fn genetic_settings() -> OptimizationSettings {
        OptimizationSettings {
            optimization_method: "genetic".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_run_is_persisted_under_its_category() {
        let engine = MockEngine::new(
            vec![
                MockEngine::report(10, "Init", "loading"),
                MockEngine::report(10, "Init", "loading"),
                MockEngine::report(55, "Searching", "evaluating"),
                MockEngine::report(100, "Complete", "Optimization completed successfully"),
            ],
            Some(outcome(9.5)),
        );
        let store = Arc::new(ResultStore::in_memory().unwrap());
        let orchestrator = RunOrchestrator::new(engine, store.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = orchestrator
            .run_optimization(genetic_settings(), &general(), Some(tx))
            .await
            .unwrap();

        let RunOutcome::Completed(completed) = result else {
            panic!("expected completed outcome");
        };
        assert_eq!(completed.best_strategy, "middle_weighted");

        let saved = store.list();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].method_type, MethodType::Genetic);
        assert!(saved[0].name.starts_with("Genetic optimization"));
        assert_eq!(store.history().len(), 1);
        assert_eq!(store.current().unwrap().financing_cost, 9.5);
        assert!(store.optimization().is_some());

        // The watcher saw the progression, including the reset counter after
        // the third poll.
        let mut snapshots = Vec::new();
        while let Ok(run) = rx.try_recv() {
            snapshots.push(run);
        }
        let at_55 = snapshots
            .iter()
            .find(|r| r.progress_percent == 55)
            .expect("watcher saw the 55% snapshot");
        assert_eq!(at_55.consecutive_unchanged_polls, 0);
        assert!(snapshots
            .iter()
            .any(|r| r.status == JobStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_run_leaves_store_untouched() {
        let engine = MockEngine::new(
            vec![
                MockEngine::report(30, "Searching", "evaluating"),
                ProgressReport {
                    progress: 100,
                    phase: "Error".to_string(),
                    message: "Genetic optimization error: population collapsed".to_string(),
                    error: true,
                    ..Default::default()
                },
            ],
            None,
        );
        let store = Arc::new(ResultStore::in_memory().unwrap());
        let orchestrator = RunOrchestrator::new(engine, store.clone());

        let result = orchestrator
            .run_optimization(genetic_settings(), &general(), None)
            .await
            .unwrap();

        let RunOutcome::Failed { message } = result else {
            panic!("expected failed outcome");
        };
        assert_eq!(message, "Genetic optimization error: population collapsed");
        assert!(store.list().is_empty());
        assert!(store.current().is_none());
        assert!(store.optimization().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_as_timeout_not_failure() {
        // The engine reports the same progress forever.
        let engine = MockEngine::new(vec![MockEngine::report(10, "Init", "loading")], None);
        let store = Arc::new(ResultStore::in_memory().unwrap());
        let orchestrator = RunOrchestrator::new(engine, store.clone());

        let result = orchestrator
            .run_optimization(genetic_settings(), &general(), None)
            .await
            .unwrap();

        let RunOutcome::Cancelled { reason } = result else {
            panic!("expected cancelled outcome");
        };
        assert!(reason.contains("timed out"));
        assert!(store.list().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_calculation_advances_slots_and_seeds_manual_history() {
        let engine = MockEngine::new(vec![MockEngine::report(0, "", "")], None);
        let store = Arc::new(ResultStore::in_memory().unwrap());
        let orchestrator = RunOrchestrator::new(engine, store.clone());

        let request = CalculationRequest {
            general_settings: general(),
            tranches_a: vec![TrancheA {
                maturity_days: 90,
                base_rate: 42.0,
                spread: 1.5,
                reinvest_rate: 40.0,
                nominal: 500_000.0,
            }],
            tranche_b: TrancheB {
                maturity_days: 200,
                base_rate: 0.0,
                spread: 0.0,
                reinvest_rate: 38.0,
                nominal: None,
            },
            npv_settings: NpvSettings {
                method: "weighted_avg_rate".to_string(),
                custom_rate: None,
            },
            is_optimized: false,
            optimization_method: None,
        };

        let result = orchestrator.run_calculation(&request).await.unwrap();
        assert_eq!(result.financing_cost, 11.0);
        assert_eq!(store.current().unwrap().financing_cost, 11.0);

        let history = store.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].method_type, MethodType::Manual);
        // Calculation results are working state, not named saves.
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_sanitize_clamps_step_for_wide_ranges() {
        let mut settings = OptimizationSettings {
            maturity_range: [32, 365],
            maturity_step: 10,
            ..Default::default()
        };
        sanitize_settings(&mut settings);
        assert_eq!(settings.maturity_step, 15);

        let mut narrow = OptimizationSettings {
            maturity_range: [100, 200],
            maturity_step: 10,
            ..Default::default()
        };
        sanitize_settings(&mut narrow);
        assert_eq!(narrow.maturity_step, 10);
    }
}
