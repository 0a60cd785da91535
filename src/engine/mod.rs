//! External structuring engine boundary.
//!
//! The engine owns every heavy computation (waterfall evaluation, classic
//! strategy search, genetic search). This module only defines the consumed
//! surface: submit a job, poll its progress, fetch the final payload, and a
//! synchronous calculate call for manual runs.

pub mod client;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{
    CalculationRequest, GeneralSettings, OptimizationOutcome, OptimizationSettings,
    StructureResult,
};

pub use client::EngineClient;

/// Handle for one submitted optimization job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
}

/// One progress observation from the engine.
///
/// Wire fields mirror the engine's progress tracker; `error` doubles as the
/// explicit failure flag (an `"Error"` phase is normalized into it by the
/// client, since the engine reports failures through the phase label).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressReport {
    pub progress: i64,
    pub phase: String,
    pub message: String,
    #[serde(default)]
    pub step: i64,
    #[serde(default)]
    pub total_steps: i64,
    #[serde(default)]
    pub elapsed_seconds: f64,
    #[serde(default)]
    pub error: bool,
}

/// Consumed surface of the external structuring engine
#[async_trait]
pub trait StructuringEngine: Send + Sync {
    /// Submit an optimization job; returns a handle for progress polling.
    async fn submit_job(
        &self,
        settings: &OptimizationSettings,
        general: &GeneralSettings,
    ) -> Result<JobHandle>;

    /// Query current progress for a running job.
    async fn query_progress(&self, job: &JobHandle) -> Result<ProgressReport>;

    /// Fetch the final payload of a completed job.
    async fn fetch_result(&self, job: &JobHandle) -> Result<OptimizationOutcome>;

    /// Evaluate one explicit configuration (synchronous request/response).
    async fn calculate(&self, request: &CalculationRequest) -> Result<StructureResult>;
}
