use thiserror::Error;

use scriptorium_core::{AttemptRecord, CostGuardError, DomainError};
use scriptorium_llm::BackendError;

use crate::artifacts::ArtifactError;
use crate::jobs::JobStoreError;

/// Why a pipeline run did not complete.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Cost policy violation. Never retried.
    #[error("phase {phase}: call blocked by cost guard: {source}")]
    Safety {
        phase: String,
        source: CostGuardError,
        attempts: Vec<AttemptRecord>,
    },

    /// Every permitted attempt at every reachable tier failed.
    #[error("phase {phase}: escalation exhausted after {} attempts: {last_error}", .attempts.len())]
    Exhausted {
        phase: String,
        attempts: Vec<AttemptRecord>,
        last_error: BackendError,
    },

    /// A backend error that retrying cannot fix (4xx, bad response, misconfiguration).
    #[error("phase {phase}: backend error: {source}")]
    Backend {
        phase: String,
        attempts: Vec<AttemptRecord>,
        source: BackendError,
    },

    /// Output failed the content-integrity check; the pipeline is reset from `phase`.
    #[error("phase {phase}: content integrity failure: {detail}")]
    Truncated { phase: String, detail: String },

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl PipelineError {
    /// Attempts made by the failing phase, oldest first.
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            PipelineError::Safety { attempts, .. }
            | PipelineError::Exhausted { attempts, .. }
            | PipelineError::Backend { attempts, .. } => attempts,
            _ => &[],
        }
    }

    /// The phase the error is attributed to, when there is one.
    pub fn phase(&self) -> Option<&str> {
        match self {
            PipelineError::Safety { phase, .. }
            | PipelineError::Exhausted { phase, .. }
            | PipelineError::Backend { phase, .. }
            | PipelineError::Truncated { phase, .. } => Some(phase),
            _ => None,
        }
    }

    pub fn is_safety_violation(&self) -> bool {
        matches!(self, PipelineError::Safety { .. })
    }
}
