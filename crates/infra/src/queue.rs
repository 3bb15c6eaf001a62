//! User-facing queue operations.
//!
//! Thin layer over `JobStore`: each operation is one conditional update plus
//! the matching audit event.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tracing::info;

use scriptorium_core::{DomainError, Job, JobId, JobStatus, NewJob, PipelineDefinition};
use scriptorium_events::{AuditSink, EventKind, JobEvent};

use crate::jobs::{JobStats, JobStore, JobStoreError, StatusUpdate};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    audit: Arc<dyn AuditSink>,
    definition: PipelineDefinition,
    top_tier: usize,
}

impl core::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobQueue")
            .field("top_tier", &self.top_tier)
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    pub fn new(
        store: Arc<dyn JobStore>,
        audit: Arc<dyn AuditSink>,
        definition: PipelineDefinition,
        top_tier: usize,
    ) -> Self {
        Self {
            store,
            audit,
            definition,
            top_tier,
        }
    }

    pub async fn submit(&self, new: NewJob) -> Result<Job, QueueError> {
        if new.source.trim().is_empty() {
            return Err(DomainError::validation("job source is empty").into());
        }
        if new.duration_minutes.is_some_and(|m| m.is_nan() || m < 0.0) {
            return Err(DomainError::validation("duration_minutes must be >= 0").into());
        }

        let job = self.store.enqueue(new).await?;
        info!(job_id = %job.id, source = %job.source, priority = job.priority, "job queued");
        self.emit(
            &job,
            EventKind::JobQueued,
            json!({
                "source": job.source,
                "priority": job.priority,
                "duration_minutes": job.duration_minutes,
                "tier_override": job.tier_override,
            }),
        );
        Ok(job)
    }

    pub async fn get(&self, id: JobId) -> Result<Job, QueueError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.list(status, limit).await?)
    }

    pub async fn stats(&self) -> Result<JobStats, QueueError> {
        Ok(self.store.stats().await?)
    }

    /// From `pending`, `in_progress` or `paused`. An in-flight phase call is
    /// not interrupted; the pipeline stops before its next phase.
    pub async fn cancel(&self, id: JobId) -> Result<Job, QueueError> {
        let job = self
            .store
            .update_status(id, StatusUpdate::to(JobStatus::Cancelled))
            .await?;
        info!(job_id = %id, "job cancelled");
        self.emit(&job, EventKind::JobCancelled, json!({ "current_phase": job.current_phase }));
        Ok(job)
    }

    pub async fn pause(&self, id: JobId) -> Result<Job, QueueError> {
        let job = self
            .store
            .update_status(id, StatusUpdate::to(JobStatus::Paused))
            .await?;
        info!(job_id = %id, "job paused");
        self.emit(&job, EventKind::JobPaused, json!({ "current_phase": job.current_phase }));
        Ok(job)
    }

    /// `paused` back to `pending`, keeping completed phases. A phase the pause
    /// left `in_progress` is archived and reset in the same update.
    pub async fn resume(&self, id: JobId) -> Result<Job, QueueError> {
        let job = self
            .store
            .update_status(
                id,
                StatusUpdate::to(JobStatus::Pending)
                    .only_from(&[JobStatus::Paused])
                    .archiving_interrupted(),
            )
            .await?;
        info!(job_id = %id, "job resumed");
        self.emit(&job, EventKind::JobResumed, serde_json::Value::Null);
        Ok(job)
    }

    /// Re-run a `failed` or `paused` job.
    ///
    /// Raises the tier floor above every tier the job has used, archives and
    /// resets the affected phases (all from `from_phase` on, or every phase that
    /// did not complete) and re-queues it. `retry_count` is left alone: it
    /// counts automatic retries only.
    pub async fn retry(&self, id: JobId, from_phase: Option<&str>) -> Result<Job, QueueError> {
        const SOURCES: [JobStatus; 2] = [JobStatus::Failed, JobStatus::Paused];

        let mut job = self.store.get(id).await?;
        if !SOURCES.contains(&job.status) {
            return Err(JobStoreError::InvalidTransition {
                id,
                from: job.status,
                to: JobStatus::Pending,
            }
            .into());
        }

        job.phases = self.definition.align(&job.phases);
        let plan = job.prepare_retry(&self.definition, from_phase, self.top_tier, Utc::now())?;

        let update = StatusUpdate::to(JobStatus::Pending)
            .only_from(&SOURCES)
            .with_phases(job.phases)
            .with_min_tier(plan.min_tier);
        let job = self.store.update_status(id, update).await?;

        info!(
            job_id = %id,
            from_phase = from_phase.unwrap_or("-"),
            min_tier = ?plan.min_tier,
            reset = ?plan.reset_phases,
            "job retried"
        );
        self.emit(
            &job,
            EventKind::JobRetried,
            json!({
                "from_phase": from_phase,
                "max_seen_tier": plan.max_seen_tier,
                "min_tier": plan.min_tier,
                "reset_phases": plan.reset_phases,
                "trigger": "user",
            }),
        );
        Ok(job)
    }

    fn emit(&self, job: &Job, kind: EventKind, data: serde_json::Value) {
        self.audit.append(JobEvent::new(kind, job.id).with_data(data));
    }
}
