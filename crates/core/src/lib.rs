//! `scriptorium-core`: job orchestration domain.
//!
//! This crate contains **pure domain** logic (no IO): the job and phase model,
//! the status transition table, tier routing and cost policy.

pub mod cost;
pub mod error;
pub mod id;
pub mod job;
pub mod phase;
pub mod pipeline;
pub mod tier;

pub use cost::{
    CostGuard, CostGuardConfig, CostGuardError, ModelPrice, PriceTable, RunCostTracker, RunSummary,
    Usage,
};
pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{Job, JobStatus, NewJob, RetryPlan};
pub use phase::{AttemptRecord, Phase, archive_interrupted, PhaseCompletion, PhaseRun, PhaseStatus};
pub use pipeline::{PhaseSpec, PipelineDefinition};
pub use tier::{DurationThreshold, TierConfig, TierDecision, TierRouter};
