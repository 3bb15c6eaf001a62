//! Job record and lifecycle.

use core::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::phase::{Phase, PhaseStatus};
use crate::pipeline::PipelineDefinition;

/// Job status. Exactly one holds at any time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by a worker
    InProgress,
    Completed,
    Failed,
    Cancelled,
    /// User-initiated hold
    Paused,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::InProgress,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Paused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Paused => "paused",
        }
    }

    /// `completed` and `cancelled` never change again. `failed` only leaves via retry.
    pub fn is_final(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// The single transition table for job status.
    ///
    /// `Pending -> InProgress` is listed here but only the store's atomic claim
    /// is allowed to perform it.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress | Paused | Cancelled)
                | (InProgress, Completed | Failed | Cancelled | Paused | Pending)
                | (Paused, Pending | Cancelled)
                | (Failed, Pending)
        )
    }

    /// Statuses from which `next` is reachable.
    pub fn sources_of(next: JobStatus) -> Vec<JobStatus> {
        JobStatus::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// Input for creating a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    /// Key of the source transcript in the artifact inbox.
    pub source: String,
    pub priority: i32,
    pub max_retries: u32,
    /// Estimated processing time of the source, in minutes.
    pub duration_minutes: Option<f64>,
    /// Explicit tier for every phase of this job.
    pub tier_override: Option<usize>,
    /// Identifiers already resolved by the metadata lookup service.
    pub metadata: serde_json::Value,
}

impl NewJob {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            priority: 0,
            max_retries: 3,
            duration_minutes: None,
            tier_override: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_duration_minutes(mut self, minutes: f64) -> Self {
        self.duration_minutes = Some(minutes);
        self
    }

    pub fn with_tier_override(mut self, tier: usize) -> Self {
        self.tier_override = Some(tier);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A queued unit of work: one transcript driven through the phase pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub source: String,
    pub priority: i32,
    pub status: JobStatus,
    /// Ordered like the pipeline, never by arrival.
    pub phases: Vec<Phase>,
    pub current_phase: Option<String>,
    pub duration_minutes: Option<f64>,
    pub tier_override: Option<usize>,
    /// Floor raised by job-level retries; the pipeline never runs below it.
    pub min_tier: Option<usize>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Claim generation. Bumped by every claim and every reap; a worker's
    /// writes only land while the job still carries the lease it claimed.
    #[serde(default)]
    pub lease: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_timestamp: Option<DateTime<Utc>>,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub metadata: serde_json::Value,
}

/// Outcome of preparing a job-level retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPlan {
    pub max_seen_tier: Option<usize>,
    pub min_tier: Option<usize>,
    pub reset_phases: Vec<String>,
}

impl Job {
    /// Build a freshly enqueued job. The id comes from the store.
    pub fn from_new(id: JobId, new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            source: new.source,
            priority: new.priority,
            status: JobStatus::Pending,
            phases: Vec::new(),
            current_phase: None,
            duration_minutes: new.duration_minutes,
            tier_override: new.tier_override,
            min_tier: None,
            retry_count: 0,
            max_retries: new.max_retries,
            lease: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            last_heartbeat: None,
            error_message: None,
            error_timestamp: None,
            total_cost: 0.0,
            total_tokens: 0,
            metadata: new.metadata,
        }
    }

    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Last liveness signal: heartbeat, else start time, else creation time.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_heartbeat
            .or(self.started_at)
            .unwrap_or(self.created_at)
    }

    /// Stale when strictly more than `stale_after` has passed since the last signal.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        now - self.last_seen() > stale_after
    }

    /// Highest tier seen across every phase, archived runs included.
    pub fn max_seen_tier(&self) -> Option<usize> {
        self.phases.iter().filter_map(Phase::highest_tier).max()
    }

    pub fn can_retry_automatically(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Prepare the job for another run.
    ///
    /// Raises `min_tier` to `min(max_seen + 1, top_tier)` (never lowering an
    /// existing floor), archives and resets the affected phases and clears the
    /// error fields. With `from_phase`, every phase from that one onward is reset,
    /// completed ones included; otherwise only phases that did not complete.
    ///
    /// Status and `retry_count` are left to the caller.
    pub fn prepare_retry(
        &mut self,
        pipeline: &PipelineDefinition,
        from_phase: Option<&str>,
        top_tier: usize,
        now: DateTime<Utc>,
    ) -> DomainResult<RetryPlan> {
        let from_index = match from_phase {
            Some(name) => Some(
                pipeline
                    .position(name)
                    .ok_or_else(|| DomainError::UnknownPhase(name.to_string()))?,
            ),
            None => None,
        };

        let max_seen_tier = self.max_seen_tier();
        if let Some(seen) = max_seen_tier {
            let floor = (seen + 1).min(top_tier);
            self.min_tier = Some(self.min_tier.map_or(floor, |existing| existing.max(floor)));
        }

        let mut reset_phases = Vec::new();
        for phase in &mut self.phases {
            let should_reset = match from_index {
                Some(from) => pipeline
                    .position(&phase.name)
                    .is_some_and(|position| position >= from),
                None => !matches!(phase.status, PhaseStatus::Completed | PhaseStatus::Pending),
            };
            if should_reset {
                phase.archive_and_reset(now);
                reset_phases.push(phase.name.clone());
            }
        }

        self.current_phase = None;
        self.started_at = None;
        self.completed_at = None;
        self.error_message = None;
        self.error_timestamp = None;

        Ok(RetryPlan {
            max_seen_tier,
            min_tier: self.min_tier,
            reset_phases,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{AttemptRecord, PhaseCompletion};
    use crate::pipeline::PhaseSpec;

    fn pipeline() -> PipelineDefinition {
        PipelineDefinition::new(vec![
            PhaseSpec::new("analyst", 0),
            PhaseSpec::new("formatter", 0),
            PhaseSpec::new("seo", 0),
            PhaseSpec::new("copy_editor", 1),
        ])
    }

    fn completed(name: &str, tier: usize) -> Phase {
        let mut phase = Phase::new(name);
        phase.mark_completed(
            PhaseCompletion {
                tier,
                tier_label: format!("t{tier}"),
                model: "m".to_string(),
                cost: 0.1,
                tokens: 10,
                history: vec![],
                artifact: format!("{name}.md"),
                reason: "base".to_string(),
            },
            Utc::now(),
        );
        phase
    }

    fn job() -> Job {
        Job::from_new(JobId::new(1), NewJob::new("talk.txt"), Utc::now())
    }

    #[test]
    fn transition_table() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Paused));
        assert!(InProgress.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Pending));

        assert!(!Completed.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(InProgress));
        assert!(!Paused.can_transition_to(InProgress));
        assert!(!Failed.can_transition_to(Paused));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn final_states_have_no_exits() {
        for status in [JobStatus::Completed, JobStatus::Cancelled] {
            assert!(JobStatus::ALL.iter().all(|next| !status.can_transition_to(*next)));
        }
    }

    #[test]
    fn status_parses_from_its_string_form() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn staleness_is_exclusive_at_the_threshold() {
        let now = Utc::now();
        let mut job = job();
        job.last_heartbeat = Some(now - Duration::seconds(300));

        assert!(!job.is_stale(now, Duration::seconds(300)));
        assert!(job.is_stale(now + Duration::seconds(1), Duration::seconds(300)));
    }

    #[test]
    fn last_seen_falls_back_to_started_at() {
        let now = Utc::now();
        let mut job = job();
        job.started_at = Some(now - Duration::seconds(10));
        assert_eq!(job.last_seen(), now - Duration::seconds(10));

        job.last_heartbeat = Some(now);
        assert_eq!(job.last_seen(), now);
    }

    #[test]
    fn retry_raises_floor_above_highest_seen_tier() {
        let mut job = job();
        let mut failed = Phase::new("formatter");
        failed.mark_failed(
            "timeout",
            vec![AttemptRecord {
                tier: 1,
                tier_label: "default".to_string(),
                model: "m".to_string(),
                error: Some("timeout".to_string()),
                timed_out: true,
                at: Utc::now(),
            }],
            Utc::now(),
        );
        job.phases = vec![completed("analyst", 0), failed];
        job.error_message = Some("boom".to_string());

        let plan = job.prepare_retry(&pipeline(), None, 2, Utc::now()).unwrap();

        assert_eq!(plan.max_seen_tier, Some(1));
        assert_eq!(plan.min_tier, Some(2));
        assert_eq!(plan.reset_phases, vec!["formatter".to_string()]);
        assert_eq!(job.phases[0].status, PhaseStatus::Completed);
        assert_eq!(job.phases[1].status, PhaseStatus::Pending);
        assert_eq!(job.phases[1].previous_runs.len(), 1);
        assert!(job.error_message.is_none());
    }

    #[test]
    fn retry_floor_is_clamped_and_never_lowered() {
        let mut job = job();
        job.phases = vec![completed("analyst", 2)];
        job.min_tier = Some(2);

        let plan = job.prepare_retry(&pipeline(), None, 2, Utc::now()).unwrap();
        assert_eq!(plan.min_tier, Some(2));

        job.phases = vec![completed("analyst", 0)];
        let plan = job.prepare_retry(&pipeline(), None, 2, Utc::now()).unwrap();
        assert_eq!(plan.min_tier, Some(2));
    }

    #[test]
    fn retry_from_phase_resets_the_suffix_only() {
        let mut job = job();
        job.phases = vec![
            completed("analyst", 0),
            completed("formatter", 0),
            completed("seo", 0),
        ];

        let plan = job
            .prepare_retry(&pipeline(), Some("formatter"), 2, Utc::now())
            .unwrap();

        assert_eq!(plan.reset_phases, vec!["formatter".to_string(), "seo".to_string()]);
        assert!(job.phases[0].is_completed());
        assert_eq!(job.phases[1].previous_runs.len(), 1);
        assert_eq!(job.phases[2].previous_runs.len(), 1);
    }

    #[test]
    fn retry_from_unknown_phase_is_rejected() {
        let mut job = job();
        let err = job
            .prepare_retry(&pipeline(), Some("translator"), 2, Utc::now())
            .unwrap_err();
        assert_eq!(err, DomainError::UnknownPhase("translator".to_string()));
    }
}
