//! Phase records owned by a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
        }
    }
}

impl core::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One backend call made for a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub tier: usize,
    pub tier_label: String,
    pub model: String,
    /// `None` when the call succeeded.
    pub error: Option<String>,
    #[serde(default)]
    pub timed_out: bool,
    pub at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Archived result of an earlier run of a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRun {
    pub status: PhaseStatus,
    pub tier: Option<usize>,
    pub tier_label: Option<String>,
    pub model: Option<String>,
    pub cost: f64,
    pub tokens: u64,
    pub attempts: u32,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
    pub archived_at: DateTime<Utc>,
}

/// Result of a successful backend call sequence for one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseCompletion {
    pub tier: usize,
    pub tier_label: String,
    pub model: String,
    pub cost: f64,
    pub tokens: u64,
    pub history: Vec<AttemptRecord>,
    pub artifact: String,
    pub reason: String,
}

/// One named stage of a job's pipeline.
///
/// `tier`/`tier_label`/`model` stay `None` until a backend call has been
/// attempted. Resetting a phase always goes through [`Phase::archive_and_reset`],
/// so earlier attempts end up in `previous_runs` instead of being dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub status: PhaseStatus,
    #[serde(default)]
    pub tier: Option<usize>,
    #[serde(default)]
    pub tier_label: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    /// Why the tier was chosen (audit only).
    #[serde(default)]
    pub reason: Option<String>,
    /// Name of the artifact holding this phase's output.
    #[serde(default)]
    pub artifact: Option<String>,
    /// Every call of the current run, failed ones included.
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
    #[serde(default)]
    pub previous_runs: Vec<PhaseRun>,
}

impl Phase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: PhaseStatus::Pending,
            tier: None,
            tier_label: None,
            model: None,
            cost: 0.0,
            tokens: 0,
            attempts: 0,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            error: None,
            reason: None,
            artifact: None,
            history: Vec::new(),
            previous_runs: Vec::new(),
        }
    }

    /// Only `pending` and `failed` phases may be (re)executed.
    pub fn is_resumable(&self) -> bool {
        matches!(self.status, PhaseStatus::Pending | PhaseStatus::Failed)
    }

    pub fn is_completed(&self) -> bool {
        self.status == PhaseStatus::Completed
    }

    pub fn mark_in_progress(&mut self, now: DateTime<Utc>) {
        self.status = PhaseStatus::InProgress;
        self.started_at = Some(now);
        self.completed_at = None;
        self.error = None;
    }

    pub fn mark_completed(&mut self, completion: PhaseCompletion, now: DateTime<Utc>) {
        self.status = PhaseStatus::Completed;
        self.tier = Some(completion.tier);
        self.tier_label = Some(completion.tier_label);
        self.model = Some(completion.model);
        self.cost += completion.cost;
        self.tokens += completion.tokens;
        self.attempts = completion.history.len() as u32;
        self.history = completion.history;
        self.artifact = Some(completion.artifact);
        self.reason = Some(completion.reason);
        self.completed_at = Some(now);
        self.error = None;
    }

    /// Record a failure. Tier and model come from the last attempt, if any call was made.
    pub fn mark_failed(
        &mut self,
        error: impl Into<String>,
        history: Vec<AttemptRecord>,
        now: DateTime<Utc>,
    ) {
        self.status = PhaseStatus::Failed;
        if let Some(last) = history.last() {
            self.tier = Some(last.tier);
            self.tier_label = Some(last.tier_label.clone());
            self.model = Some(last.model.clone());
        }
        self.attempts = history.len() as u32;
        self.history = history;
        self.error = Some(error.into());
        self.completed_at = Some(now);
    }

    pub fn mark_skipped(&mut self, now: DateTime<Utc>) {
        self.status = PhaseStatus::Skipped;
        self.completed_at = Some(now);
    }

    /// Archive the current result into `previous_runs`, then clear it.
    ///
    /// A phase that never ran (pending, no tier) has nothing to archive and is
    /// left as is apart from the status.
    pub fn archive_and_reset(&mut self, now: DateTime<Utc>) {
        let attempted = self.tier.is_some() || self.status != PhaseStatus::Pending;
        if attempted {
            self.previous_runs.push(PhaseRun {
                status: self.status,
                tier: self.tier,
                tier_label: self.tier_label.take(),
                model: self.model.take(),
                cost: self.cost,
                tokens: self.tokens,
                attempts: self.attempts,
                completed_at: self.completed_at,
                error: self.error.take(),
                history: core::mem::take(&mut self.history),
                archived_at: now,
            });
            self.retry_count += 1;
        }

        self.status = PhaseStatus::Pending;
        self.tier = None;
        self.tier_label = None;
        self.model = None;
        self.cost = 0.0;
        self.tokens = 0;
        self.attempts = 0;
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
        self.reason = None;
        self.artifact = None;
        self.history.clear();
    }

    /// Left `in_progress` by a run that stopped before recording an outcome.
    pub fn is_interrupted(&self) -> bool {
        self.status == PhaseStatus::InProgress
    }

    /// Highest tier this phase has ever run at, including archived runs.
    pub fn highest_tier(&self) -> Option<usize> {
        self.previous_runs
            .iter()
            .filter_map(|r| r.tier)
            .chain(self.tier)
            .max()
    }
}

/// Archive and reset every interrupted phase. Returns their names.
pub fn archive_interrupted(phases: &mut [Phase], now: DateTime<Utc>) -> Vec<String> {
    phases
        .iter_mut()
        .filter(|phase| phase.is_interrupted())
        .map(|phase| {
            phase.archive_and_reset(now);
            phase.name.clone()
        })
        .collect()
}
