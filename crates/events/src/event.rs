use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use scriptorium_core::JobId;

/// Lifecycle event type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobQueued,
    JobStarted,
    JobCompleted,
    JobFailed,
    JobCancelled,
    JobPaused,
    JobResumed,
    JobRetried,
    PhaseStarted,
    PhaseCompleted,
    PhaseFailed,
    PhaseSkipped,
    TierEscalated,
    CostUpdate,
    /// Raised by the engine itself (e.g. a reaped stuck job).
    SystemError,
}

impl EventKind {
    /// Stable event name (e.g. "job.phase.completed").
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::JobQueued => "job.queued",
            EventKind::JobStarted => "job.started",
            EventKind::JobCompleted => "job.completed",
            EventKind::JobFailed => "job.failed",
            EventKind::JobCancelled => "job.cancelled",
            EventKind::JobPaused => "job.paused",
            EventKind::JobResumed => "job.resumed",
            EventKind::JobRetried => "job.retried",
            EventKind::PhaseStarted => "job.phase.started",
            EventKind::PhaseCompleted => "job.phase.completed",
            EventKind::PhaseFailed => "job.phase.failed",
            EventKind::PhaseSkipped => "job.phase.skipped",
            EventKind::TierEscalated => "job.tier.escalated",
            EventKind::CostUpdate => "job.cost.updated",
            EventKind::SystemError => "system.error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            EventKind::JobFailed | EventKind::PhaseFailed | EventKind::SystemError
        )
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An audit event. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub event_id: Uuid,
    pub job_id: Option<JobId>,
    pub occurred_at: DateTime<Utc>,
    pub kind: EventKind,
    pub data: JsonValue,
}

impl JobEvent {
    pub fn new(kind: EventKind, job_id: JobId) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            job_id: Some(job_id),
            occurred_at: Utc::now(),
            kind,
            data: JsonValue::Null,
        }
    }

    /// Event not tied to a single job.
    pub fn system(kind: EventKind) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            job_id: None,
            occurred_at: Utc::now(),
            kind,
            data: JsonValue::Null,
        }
    }

    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = data;
        self
    }

    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}
