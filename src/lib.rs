//! Structurer Client Library
//!
//! Client core for an ABS structuring workflow. The heavy computation
//! (cash-flow waterfall evaluation, classic and genetic structure
//! optimization) runs in an external engine consumed over HTTP; this crate
//! owns job-progress tracking, durable result storage and result comparison.
//! No process surface: the orchestrator is invoked programmatically.

pub mod comparison;
pub mod engine;
pub mod models;
pub mod orchestrator;
pub mod store;
pub mod tracker;

pub use comparison::{percent_diff, ComparisonEngine, ComparisonReport};
pub use engine::{EngineClient, JobHandle, ProgressReport, StructuringEngine};
pub use models::{Config, MethodType, SavedResult, StructureResult};
pub use orchestrator::{RunOrchestrator, RunOutcome};
pub use store::{ResultRef, ResultStore};
pub use tracker::{JobRun, JobStatus, JobTracker, TrackedJob};
