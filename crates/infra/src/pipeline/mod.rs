//! Phase pipeline.
//!
//! - `PhasePipeline` walks the configured phases in order, resuming past
//!   completed ones, and writes one artifact per phase plus a manifest.
//! - `Escalator` makes the backend calls: cost guard first, bounded attempts
//!   per tier, then `TierRouter::next_tier`.
//! - `RetryPolicy` / `EscalationSettings` configure the loop.

pub mod error;
pub mod escalation;
pub mod manifest;
pub mod retry;
pub mod runner;

pub use error::PipelineError;
pub use escalation::{Escalator, PhaseCall};
pub use manifest::{MANIFEST_NAME, Manifest, ManifestPhase, RunTotals};
pub use retry::{BackoffStrategy, EscalationSettings, RetryPolicy};
pub use runner::{PhasePipeline, RunOutcome};
