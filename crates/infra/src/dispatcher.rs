//! Dispatch loops: claim, heartbeat, run, reconcile.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scriptorium_core::{Job, JobId, JobStatus, RunCostTracker, RunSummary};
use scriptorium_events::{AuditSink, EventKind, JobEvent};

use crate::jobs::{JobStore, JobStoreError, StatusUpdate};
use crate::pipeline::{PhasePipeline, PipelineError, RunOutcome};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    /// Number of dispatch loops; each runs at most one job at a time.
    pub max_concurrent_jobs: usize,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            poll_interval_ms: 1_000,
            heartbeat_interval_secs: 30,
        }
    }
}

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub run: RunSummary,
}

/// Handle to running dispatch loops.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Stop claiming and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.join().await;
    }

    pub async fn join(self) {
        for task in self.tasks {
            if let Err(err) = task.await {
                error!(error = %err, "dispatch loop panicked");
            }
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    pipeline: PhasePipeline,
    audit: Arc<dyn AuditSink>,
    settings: DispatcherSettings,
}

impl core::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("settings", &self.settings)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        pipeline: PhasePipeline,
        audit: Arc<dyn AuditSink>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            store,
            pipeline,
            audit,
            settings,
        }
    }

    /// Start `max_concurrent_jobs` loops. They exit once `shutdown` is cancelled
    /// and their current job, if any, has finished.
    pub fn spawn(&self, shutdown: CancellationToken) -> DispatcherHandle {
        let slots = self.settings.max_concurrent_jobs.max(1);
        let tasks = (0..slots)
            .map(|slot| {
                let dispatcher = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { dispatcher.dispatch_loop(slot, shutdown).await })
            })
            .collect();
        DispatcherHandle { shutdown, tasks }
    }

    async fn dispatch_loop(self, slot: usize, shutdown: CancellationToken) {
        info!(slot, "dispatch loop started");
        let poll = Duration::from_millis(self.settings.poll_interval_ms);

        while !shutdown.is_cancelled() {
            match self.run_once().await {
                Ok(Some(report)) => {
                    debug!(slot, job_id = %report.job_id, status = %report.status, "job processed");
                    continue;
                }
                Ok(None) => {}
                Err(err) => error!(slot, error = %err, "failed to claim job"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }
        }

        info!(slot, "dispatch loop stopped");
    }

    /// Claim and fully process one job. `None` when nothing is pending.
    pub async fn run_once(&self) -> Result<Option<JobReport>, JobStoreError> {
        let Some(job) = self.store.claim_next_pending().await? else {
            return Ok(None);
        };
        Ok(Some(self.process(job).await))
    }

    async fn process(&self, job: Job) -> JobReport {
        let id = job.id;
        info!(
            job_id = %id,
            source = %job.source,
            priority = job.priority,
            retry_count = job.retry_count,
            min_tier = ?job.min_tier,
            "job claimed"
        );
        self.emit(
            id,
            EventKind::JobStarted,
            json!({ "retry_count": job.retry_count, "min_tier": job.min_tier }),
        );

        let mut tracker = RunCostTracker::new(id, job.started_at.unwrap_or_else(Utc::now));
        let heartbeat_stop = CancellationToken::new();
        let lost = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(id, job.lease, heartbeat_stop.clone(), lost.clone());

        let result = self.pipeline.run(&job, &mut tracker, &lost).await;

        heartbeat_stop.cancel();
        if let Err(err) = heartbeat.await {
            warn!(job_id = %id, error = %err, "heartbeat task panicked");
        }

        let run = tracker.finish(Utc::now());
        if let Err(err) = self
            .store
            .add_run_costs(id, run.total_cost, run.total_tokens)
            .await
        {
            warn!(job_id = %id, error = %err, "failed to record run costs");
        }
        self.emit(
            id,
            EventKind::CostUpdate,
            json!({
                "run_cost": run.total_cost,
                "run_tokens": run.total_tokens,
                "calls": run.call_count,
                "duration_ms": run.duration_ms,
            }),
        );

        let status = match self.reconcile(&job, result).await {
            Ok(status) => status,
            Err(err) => {
                // Lost a race (cancel, pause, reaper) or the store is down; the reaper covers the latter.
                warn!(job_id = %id, error = %err, "could not record job outcome");
                self.store
                    .get(id)
                    .await
                    .map(|j| j.status)
                    .unwrap_or(JobStatus::InProgress)
            }
        };
        JobReport {
            job_id: id,
            status,
            run,
        }
    }

    async fn reconcile(
        &self,
        job: &Job,
        result: Result<RunOutcome, PipelineError>,
    ) -> Result<JobStatus, ReconcileError> {
        let id = job.id;
        match result {
            Ok(RunOutcome::Completed { manifest }) => {
                self.store
                    .update_status(id, StatusUpdate::to(JobStatus::Completed).holding(job.lease))
                    .await?;
                info!(job_id = %id, phase_cost = manifest.phase_cost, "job completed");
                self.emit(
                    id,
                    EventKind::JobCompleted,
                    json!({
                        "phase_cost": manifest.phase_cost,
                        "run_cost": manifest.run.cost,
                        "phases": manifest.phases.len(),
                    }),
                );
                Ok(JobStatus::Completed)
            }
            Ok(RunOutcome::Stopped { status }) => Ok(status),
            Ok(RunOutcome::Abandoned) => {
                warn!(job_id = %id, lease = job.lease, "run abandoned; job belongs to a newer claim");
                Ok(self.store.get(id).await?.status)
            }
            Err(PipelineError::Truncated { phase, detail }) => {
                self.requeue_from(job, &phase, &detail).await
            }
            Err(err) => self.fail(job, err.phase(), &err.to_string()).await,
        }
    }

    /// Content-integrity failure: reset the pipeline from `phase` on and
    /// re-queue, while automatic retries remain.
    async fn requeue_from(
        &self,
        claimed: &Job,
        phase: &str,
        detail: &str,
    ) -> Result<JobStatus, ReconcileError> {
        let id = claimed.id;
        let mut job = self.store.get(id).await?;
        if job.lease != claimed.lease {
            return Err(JobStoreError::LeaseLost(id).into());
        }
        if job.status != JobStatus::InProgress {
            return Ok(job.status);
        }
        if !job.can_retry_automatically() {
            let message = format!(
                "content integrity failure in phase {phase}: {detail} (retries exhausted: {}/{})",
                job.retry_count, job.max_retries
            );
            return self.fail(claimed, Some(phase), &message).await;
        }

        let definition = self.pipeline.definition();
        job.phases = definition.align(&job.phases);
        let plan = job.prepare_retry(
            definition,
            Some(phase),
            self.pipeline.router().top_tier(),
            Utc::now(),
        )?;

        let update = StatusUpdate::to(JobStatus::Pending)
            .only_from(&[JobStatus::InProgress])
            .holding(claimed.lease)
            .with_phases(job.phases)
            .with_min_tier(plan.min_tier)
            .incrementing_retry();
        let job = self.store.update_status(id, update).await?;

        warn!(
            job_id = %id,
            phase,
            detail,
            retry_count = job.retry_count,
            min_tier = ?plan.min_tier,
            "content integrity failure; job re-queued"
        );
        self.emit(
            id,
            EventKind::JobRetried,
            json!({
                "trigger": "integrity",
                "from_phase": phase,
                "detail": detail,
                "retry_count": job.retry_count,
                "min_tier": plan.min_tier,
                "reset_phases": plan.reset_phases,
            }),
        );
        Ok(JobStatus::Pending)
    }

    async fn fail(
        &self,
        job: &Job,
        phase: Option<&str>,
        message: &str,
    ) -> Result<JobStatus, ReconcileError> {
        let id = job.id;
        self.store
            .update_status(id, StatusUpdate::failed(message).holding(job.lease))
            .await?;
        error!(job_id = %id, phase = phase.unwrap_or("-"), error = message, "job failed");
        self.emit(
            id,
            EventKind::JobFailed,
            json!({ "phase": phase, "error": message }),
        );
        Ok(JobStatus::Failed)
    }

    /// Heartbeat under `lease` until `stop`. Cancels `lost` once the lease is gone.
    fn spawn_heartbeat(
        &self,
        id: JobId,
        lease: u32,
        stop: CancellationToken,
        lost: CancellationToken,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        let interval = Duration::from_secs(self.settings.heartbeat_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match store.heartbeat(id, lease, Utc::now()).await {
                    Ok(true) => debug!(job_id = %id, "heartbeat"),
                    Ok(false) => {
                        warn!(job_id = %id, lease, "lease lost; cancelling run");
                        lost.cancel();
                        break;
                    }
                    Err(err) => warn!(job_id = %id, error = %err, "heartbeat failed"),
                }
            }
        })
    }

    fn emit(&self, id: JobId, kind: EventKind, data: serde_json::Value) {
        self.audit.append(JobEvent::new(kind, id).with_data(data));
    }
}

#[derive(Debug, thiserror::Error)]
enum ReconcileError {
    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Domain(#[from] scriptorium_core::DomainError),
}
