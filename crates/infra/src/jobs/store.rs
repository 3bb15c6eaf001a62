//! Job store abstraction and the in-memory implementation.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use scriptorium_core::{Job, JobId, JobStatus, NewJob, Phase, archive_interrupted};

/// Job store error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// The job was reaped or claimed again since this worker claimed it.
    #[error("job {0} no longer holds this worker's lease")]
    LeaseLost(JobId),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Outcome of reaping one stale job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum ReapAction {
    /// Back to `pending` for another claim.
    Reset { retry_count: u32 },
    /// Retries exhausted; now `failed`.
    Failed { retry_count: u32 },
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub paused: usize,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed + self.cancelled + self.paused
    }

    pub(crate) fn count(&mut self, status: JobStatus, n: usize) {
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::InProgress => self.in_progress += n,
            JobStatus::Completed => self.completed += n,
            JobStatus::Failed => self.failed += n,
            JobStatus::Cancelled => self.cancelled += n,
            JobStatus::Paused => self.paused += n,
        }
    }
}

/// A conditional status change plus the fields that go with it.
///
/// `completed`/`failed` stamp `completed_at`; `failed` also stamps
/// `error_timestamp`. Going back to `pending` clears the run fields
/// (`started_at`, `current_phase`, heartbeat) and the error fields.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub at: DateTime<Utc>,
    pub error_message: Option<String>,
    /// Replaces the phase list (retry resets).
    pub phases: Option<Vec<Phase>>,
    pub min_tier: Option<usize>,
    pub increment_retry: bool,
    /// Narrows the statuses the job may currently be in.
    pub only_from: Option<Vec<JobStatus>>,
    /// Worker updates only apply while the job still carries this lease.
    pub lease: Option<u32>,
    /// Archive phases a stopped run left `in_progress`.
    pub archive_interrupted: bool,
}

impl StatusUpdate {
    pub fn to(status: JobStatus) -> Self {
        Self {
            status,
            at: Utc::now(),
            error_message: None,
            phases: None,
            min_tier: None,
            increment_retry: false,
            only_from: None,
            lease: None,
            archive_interrupted: false,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::to(JobStatus::Failed).with_error(message)
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_phases(mut self, phases: Vec<Phase>) -> Self {
        self.phases = Some(phases);
        self
    }

    pub fn with_min_tier(mut self, min_tier: Option<usize>) -> Self {
        self.min_tier = min_tier;
        self
    }

    pub fn incrementing_retry(mut self) -> Self {
        self.increment_retry = true;
        self
    }

    pub fn only_from(mut self, statuses: &[JobStatus]) -> Self {
        self.only_from = Some(statuses.to_vec());
        self
    }

    pub fn holding(mut self, lease: u32) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn archiving_interrupted(mut self) -> Self {
        self.archive_interrupted = true;
        self
    }

    /// Check lease and source status against the job's current state.
    pub fn check(&self, job: &Job) -> Result<(), JobStoreError> {
        if self.lease.is_some_and(|lease| lease != job.lease) {
            return Err(JobStoreError::LeaseLost(job.id));
        }
        if !self.allowed_sources().contains(&job.status) {
            return Err(JobStoreError::InvalidTransition {
                id: job.id,
                from: job.status,
                to: self.status,
            });
        }
        Ok(())
    }

    /// Statuses the job may be in for this update to apply.
    ///
    /// `in_progress` is never a target: only the claim may set it.
    pub fn allowed_sources(&self) -> Vec<JobStatus> {
        if self.status == JobStatus::InProgress {
            return Vec::new();
        }
        JobStatus::sources_of(self.status)
            .into_iter()
            .filter(|s| self.only_from.as_ref().is_none_or(|only| only.contains(s)))
            .collect()
    }

    pub fn apply(&self, job: &mut Job) {
        job.status = self.status;
        match self.status {
            JobStatus::Completed => {
                job.completed_at = Some(self.at);
            }
            JobStatus::Failed => {
                job.completed_at = Some(self.at);
                job.error_message = Some(
                    self.error_message
                        .clone()
                        .unwrap_or_else(|| "job failed".to_string()),
                );
                job.error_timestamp = Some(self.at);
            }
            JobStatus::Pending => {
                job.started_at = None;
                job.current_phase = None;
                job.completed_at = None;
                job.last_heartbeat = None;
                job.error_message = None;
                job.error_timestamp = None;
            }
            JobStatus::InProgress | JobStatus::Cancelled | JobStatus::Paused => {}
        }
        if let Some(phases) = &self.phases {
            job.phases = phases.clone();
        }
        if self.archive_interrupted {
            archive_interrupted(&mut job.phases, self.at);
        }
        if let Some(min_tier) = self.min_tier {
            job.min_tier = Some(min_tier);
        }
        if self.increment_retry {
            job.retry_count += 1;
        }
    }
}

/// Job store abstraction.
///
/// Implementations must make `claim_next_pending`, `update_status`,
/// `record_phases`, `heartbeat` and `reap_stale` atomic conditional updates:
/// a job is never handed to two claimants, and a final job is never brought back.
///
/// Every claim and every reap bumps `Job::lease`. Worker writes carry the lease
/// they claimed and fail with `LeaseLost` once it moved on, so a worker that was
/// reaped cannot touch the job's next run.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `pending` job; the store assigns the id.
    async fn enqueue(&self, new: NewJob) -> Result<Job, JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Job, JobStoreError>;

    /// Jobs in claim order (priority desc, then oldest first).
    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;

    /// Atomically move the best pending job to `in_progress` under a new lease.
    async fn claim_next_pending(&self) -> Result<Option<Job>, JobStoreError>;

    async fn update_status(&self, id: JobId, update: StatusUpdate) -> Result<Job, JobStoreError>;

    /// Replace the phase list while the job still carries `lease`.
    ///
    /// Not tied to `in_progress`: a result finished after a pause or cancel is
    /// still recorded.
    async fn record_phases(
        &self,
        id: JobId,
        lease: u32,
        phases: &[Phase],
        current_phase: Option<&str>,
    ) -> Result<(), JobStoreError>;

    /// Add one run's spend to the job's persisted totals.
    async fn add_run_costs(&self, id: JobId, cost: f64, tokens: u64) -> Result<(), JobStoreError>;

    /// Stamp `last_heartbeat` while `in_progress`. Returns `false` once `lease`
    /// is lost.
    async fn heartbeat(&self, id: JobId, lease: u32, at: DateTime<Utc>) -> Result<bool, JobStoreError>;

    /// `in_progress` jobs whose last liveness signal is older than `stale_before`.
    async fn find_stale(&self, stale_before: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    /// Reset or fail one stale job, re-checking staleness in the same update.
    ///
    /// Bumps the lease. The retry counter is incremented first; the job goes back to `pending`
    /// while the new count is still below `max_retries`, otherwise it fails
    /// with `message`. `None` when the job was reclaimed or finished meanwhile.
    async fn reap_stale(
        &self,
        id: JobId,
        stale_before: DateTime<Utc>,
        message: &str,
    ) -> Result<Option<ReapAction>, JobStoreError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn enqueue(&self, new: NewJob) -> Result<Job, JobStoreError> {
        (**self).enqueue(new).await
    }

    async fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        (**self).get(id).await
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(status, limit).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }

    async fn claim_next_pending(&self) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next_pending().await
    }

    async fn update_status(&self, id: JobId, update: StatusUpdate) -> Result<Job, JobStoreError> {
        (**self).update_status(id, update).await
    }

    async fn record_phases(
        &self,
        id: JobId,
        lease: u32,
        phases: &[Phase],
        current_phase: Option<&str>,
    ) -> Result<(), JobStoreError> {
        (**self).record_phases(id, lease, phases, current_phase).await
    }

    async fn add_run_costs(&self, id: JobId, cost: f64, tokens: u64) -> Result<(), JobStoreError> {
        (**self).add_run_costs(id, cost, tokens).await
    }

    async fn heartbeat(&self, id: JobId, lease: u32, at: DateTime<Utc>) -> Result<bool, JobStoreError> {
        (**self).heartbeat(id, lease, at).await
    }

    async fn find_stale(&self, stale_before: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_stale(stale_before).await
    }

    async fn reap_stale(
        &self,
        id: JobId,
        stale_before: DateTime<Utc>,
        message: &str,
    ) -> Result<Option<ReapAction>, JobStoreError> {
        (**self).reap_stale(id, stale_before, message).await
    }
}

/// Priority desc, then enqueue time, then id.
pub(crate) fn claim_order(a: &Job, b: &Job) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    next_id: i64,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, JobStoreError> {
        self.inner
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, JobStoreError> {
        self.inner
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, new: NewJob) -> Result<Job, JobStoreError> {
        let mut inner = self.write()?;
        inner.next_id += 1;
        let job = Job::from_new(JobId::new(inner.next_id), new, Utc::now());
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        self.read()?
            .jobs
            .get(&id)
            .cloned()
            .ok_or(JobStoreError::NotFound(id))
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read()?;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(claim_order);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let inner = self.read()?;
        let mut stats = JobStats::default();
        for job in inner.jobs.values() {
            stats.count(job.status, 1);
        }
        Ok(stats)
    }

    async fn claim_next_pending(&self) -> Result<Option<Job>, JobStoreError> {
        let mut inner = self.write()?;
        let Some(id) = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .min_by(|a, b| claim_order(a, b))
            .map(|j| j.id)
        else {
            return Ok(None);
        };

        let job = inner.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        job.status = JobStatus::InProgress;
        job.lease += 1;
        job.started_at = Some(Utc::now());
        job.completed_at = None;
        job.last_heartbeat = None;
        Ok(Some(job.clone()))
    }

    async fn update_status(&self, id: JobId, update: StatusUpdate) -> Result<Job, JobStoreError> {
        let mut inner = self.write()?;
        let job = inner.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        update.check(job)?;
        update.apply(job);
        Ok(job.clone())
    }

    async fn record_phases(
        &self,
        id: JobId,
        lease: u32,
        phases: &[Phase],
        current_phase: Option<&str>,
    ) -> Result<(), JobStoreError> {
        let mut inner = self.write()?;
        let job = inner.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if job.lease != lease {
            return Err(JobStoreError::LeaseLost(id));
        }
        job.phases = phases.to_vec();
        job.current_phase = current_phase.map(str::to_string);
        Ok(())
    }

    async fn add_run_costs(&self, id: JobId, cost: f64, tokens: u64) -> Result<(), JobStoreError> {
        let mut inner = self.write()?;
        let job = inner.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        job.total_cost += cost;
        job.total_tokens += tokens;
        Ok(())
    }

    async fn heartbeat(&self, id: JobId, lease: u32, at: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let mut inner = self.write()?;
        let job = inner.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if job.lease != lease {
            return Ok(false);
        }
        if job.status == JobStatus::InProgress {
            job.last_heartbeat = Some(at);
        }
        Ok(true)
    }

    async fn find_stale(&self, stale_before: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read()?;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::InProgress && j.last_seen() < stale_before)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn reap_stale(
        &self,
        id: JobId,
        stale_before: DateTime<Utc>,
        message: &str,
    ) -> Result<Option<ReapAction>, JobStoreError> {
        let mut inner = self.write()?;
        let job = inner.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if job.status != JobStatus::InProgress || job.last_seen() >= stale_before {
            return Ok(None);
        }

        let retry_count = job.retry_count + 1;
        let update = if retry_count < job.max_retries {
            StatusUpdate::to(JobStatus::Pending)
        } else {
            StatusUpdate::failed(message)
        };
        update.incrementing_retry().apply(job);
        job.lease += 1;

        Ok(Some(if job.status == JobStatus::Pending {
            ReapAction::Reset { retry_count }
        } else {
            ReapAction::Failed { retry_count }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    #[tokio::test]
    async fn claims_by_priority_then_fifo() {
        let store = InMemoryJobStore::new();
        let low = store.enqueue(NewJob::new("low.txt").with_priority(1)).await.unwrap();
        let high = store.enqueue(NewJob::new("high.txt").with_priority(10)).await.unwrap();
        let high_later = store.enqueue(NewJob::new("later.txt").with_priority(10)).await.unwrap();

        let first = store.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
        assert_eq!(first.status, JobStatus::InProgress);
        assert!(first.started_at.is_some());

        assert_eq!(store.claim_next_pending().await.unwrap().unwrap().id, high_later.id);
        assert_eq!(store.claim_next_pending().await.unwrap().unwrap().id, low.id);
        assert!(store.claim_next_pending().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = InMemoryJobStore::new();
        let missing = JobId::new(42);
        assert_eq!(store.get(missing).await.unwrap_err(), JobStoreError::NotFound(missing));
        assert!(matches!(
            store.update_status(missing, StatusUpdate::to(JobStatus::Cancelled)).await,
            Err(JobStoreError::NotFound(_))
        ));
        assert!(store.heartbeat(missing, 1, Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn final_jobs_are_never_resurrected() {
        let store = InMemoryJobStore::new();
        let job = store.enqueue(NewJob::new("a.txt")).await.unwrap();
        store
            .update_status(job.id, StatusUpdate::to(JobStatus::Cancelled))
            .await
            .unwrap();

        let err = store
            .update_status(job.id, StatusUpdate::to(JobStatus::Pending))
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::InvalidTransition { from: JobStatus::Cancelled, .. }));
        assert!(store.claim_next_pending().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn in_progress_is_only_reachable_by_claim() {
        let store = InMemoryJobStore::new();
        let job = store.enqueue(NewJob::new("a.txt")).await.unwrap();
        assert!(matches!(
            store.update_status(job.id, StatusUpdate::to(JobStatus::InProgress)).await,
            Err(JobStoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn failure_stamps_error_fields_and_retry_clears_them() {
        let store = InMemoryJobStore::new();
        let job = store.enqueue(NewJob::new("a.txt")).await.unwrap();
        store.claim_next_pending().await.unwrap();

        let failed = store
            .update_status(job.id, StatusUpdate::failed("escalation exhausted"))
            .await
            .unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("escalation exhausted"));
        assert!(failed.error_timestamp.is_some());
        assert!(failed.completed_at.is_some());

        let retried = store
            .update_status(job.id, StatusUpdate::to(JobStatus::Pending).with_min_tier(Some(2)))
            .await
            .unwrap();
        assert!(retried.error_message.is_none());
        assert!(retried.completed_at.is_none());
        assert!(retried.started_at.is_none());
        assert_eq!(retried.min_tier, Some(2));
    }

    #[tokio::test]
    async fn only_from_narrows_the_transition_table() {
        let store = InMemoryJobStore::new();
        let job = store.enqueue(NewJob::new("a.txt")).await.unwrap();
        store.claim_next_pending().await.unwrap();
        store
            .update_status(job.id, StatusUpdate::failed("boom"))
            .await
            .unwrap();

        let resume = StatusUpdate::to(JobStatus::Pending).only_from(&[JobStatus::Paused]);
        assert!(matches!(
            store.update_status(job.id, resume).await,
            Err(JobStoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn phases_are_only_written_under_the_current_lease() {
        let store = InMemoryJobStore::new();
        let job = store.enqueue(NewJob::new("a.txt")).await.unwrap();
        let phases = vec![Phase::new("analyst")];

        assert_eq!(
            store.record_phases(job.id, job.lease + 1, &phases, None).await.unwrap_err(),
            JobStoreError::LeaseLost(job.id)
        );

        let claimed = store.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(claimed.lease, job.lease + 1);
        store
            .record_phases(job.id, claimed.lease, &phases, Some("analyst"))
            .await
            .unwrap();
        let stored = store.get(job.id).await.unwrap();
        assert_eq!(stored.phases, phases);
        assert_eq!(stored.current_phase.as_deref(), Some("analyst"));
    }

    #[tokio::test]
    async fn paused_job_still_accepts_its_workers_phases() {
        let store = InMemoryJobStore::new();
        let job = store.enqueue(NewJob::new("a.txt")).await.unwrap();
        let claimed = store.claim_next_pending().await.unwrap().unwrap();
        store
            .update_status(job.id, StatusUpdate::to(JobStatus::Paused))
            .await
            .unwrap();

        let phases = vec![Phase::new("analyst")];
        store
            .record_phases(job.id, claimed.lease, &phases, None)
            .await
            .unwrap();
        assert!(store.heartbeat(job.id, claimed.lease, Utc::now()).await.unwrap());
        let stored = store.get(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Paused);
        assert_eq!(stored.last_heartbeat, None);
    }

    #[tokio::test]
    async fn reclaimed_job_rejects_the_previous_worker() {
        let store = InMemoryJobStore::new();
        let job = store.enqueue(NewJob::new("a.txt")).await.unwrap();
        let first = store.claim_next_pending().await.unwrap().unwrap();
        let now = Utc::now();
        store
            .reap_stale(job.id, now + Duration::minutes(10), "stuck")
            .await
            .unwrap();
        let second = store.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(second.lease, first.lease + 2);

        let phases = vec![Phase::new("analyst")];
        assert_eq!(
            store.record_phases(job.id, first.lease, &phases, None).await.unwrap_err(),
            JobStoreError::LeaseLost(job.id)
        );
        assert!(!store.heartbeat(job.id, first.lease, now).await.unwrap());
        assert_eq!(
            store
                .update_status(job.id, StatusUpdate::failed("late").holding(first.lease))
                .await
                .unwrap_err(),
            JobStoreError::LeaseLost(job.id)
        );

        let current = store.get(job.id).await.unwrap();
        assert_eq!(current.status, JobStatus::InProgress);
        assert!(current.phases.is_empty());
        assert!(store.heartbeat(job.id, second.lease, now).await.unwrap());
    }

    #[tokio::test]
    async fn reaping_increments_then_resets_or_fails() {
        let store = InMemoryJobStore::new();
        let job = store
            .enqueue(NewJob::new("a.txt").with_max_retries(2))
            .await
            .unwrap();
        let now = Utc::now();

        let claimed = store.claim_next_pending().await.unwrap().unwrap();
        store.heartbeat(job.id, claimed.lease, now - Duration::minutes(10)).await.unwrap();
        let action = store
            .reap_stale(job.id, now - Duration::minutes(5), "stuck")
            .await
            .unwrap();
        assert_eq!(action, Some(ReapAction::Reset { retry_count: 1 }));
        let reset = store.get(job.id).await.unwrap();
        assert_eq!(reset.status, JobStatus::Pending);
        assert!(reset.last_heartbeat.is_none());

        let claimed = store.claim_next_pending().await.unwrap().unwrap();
        store.heartbeat(job.id, claimed.lease, now - Duration::minutes(10)).await.unwrap();
        let action = store
            .reap_stale(job.id, now - Duration::minutes(5), "stuck")
            .await
            .unwrap();
        assert_eq!(action, Some(ReapAction::Failed { retry_count: 2 }));
        assert_eq!(store.get(job.id).await.unwrap().error_message.as_deref(), Some("stuck"));
    }

    #[tokio::test]
    async fn reaping_skips_jobs_that_recovered() {
        let store = InMemoryJobStore::new();
        let job = store.enqueue(NewJob::new("a.txt")).await.unwrap();
        let claimed = store.claim_next_pending().await.unwrap().unwrap();
        let now = Utc::now();
        store.heartbeat(job.id, claimed.lease, now).await.unwrap();

        let action = store
            .reap_stale(job.id, now - Duration::minutes(5), "stuck")
            .await
            .unwrap();
        assert_eq!(action, None);
        assert_eq!(store.get(job.id).await.unwrap().status, JobStatus::InProgress);
    }

    #[tokio::test]
    async fn stats_count_every_status() {
        let store = InMemoryJobStore::new();
        for i in 0..4 {
            store.enqueue(NewJob::new(format!("{i}.txt"))).await.unwrap();
        }
        let claimed = store.claim_next_pending().await.unwrap().unwrap();
        store
            .update_status(claimed.id, StatusUpdate::to(JobStatus::Completed))
            .await
            .unwrap();
        store.claim_next_pending().await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.in_progress, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total(), 4);
    }

    proptest! {
        #[test]
        fn claim_returns_highest_priority_first(priorities in proptest::collection::vec(-5i32..5, 1..12)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let store = InMemoryJobStore::new();
                for (i, p) in priorities.iter().enumerate() {
                    store.enqueue(NewJob::new(format!("{i}.txt")).with_priority(*p)).await.unwrap();
                }

                let mut claimed = Vec::new();
                while let Some(job) = store.claim_next_pending().await.unwrap() {
                    claimed.push((job.priority, job.id));
                }

                prop_assert_eq!(claimed.len(), priorities.len());
                for pair in claimed.windows(2) {
                    let (p0, id0) = pair[0];
                    let (p1, id1) = pair[1];
                    prop_assert!(p0 > p1 || (p0 == p1 && id0 < id1));
                }
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
