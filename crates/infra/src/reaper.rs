//! Stuck job reaper.
//!
//! A job is stuck when it is `in_progress` and its last liveness signal
//! (heartbeat, else start time) is strictly older than `stale_after_secs`.
//! Each sweep resets stuck jobs to `pending` while automatic retries remain and
//! fails them otherwise. Every reset goes through `JobStore::reap_stale`, which
//! re-checks status and staleness in the same conditional update, so a job that
//! was finished or heartbeated since the scan is left alone.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use scriptorium_core::JobId;
use scriptorium_events::{AuditSink, EventKind, JobEvent};

use crate::jobs::{JobStore, JobStoreError, ReapAction};

pub const STUCK_JOB_MESSAGE: &str = "job stopped sending heartbeats and exhausted its retries";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperSettings {
    pub interval_secs: u64,
    pub stale_after_secs: u64,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            stale_after_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapSummary {
    pub reset: Vec<JobId>,
    pub failed: Vec<JobId>,
}

impl ReapSummary {
    pub fn is_empty(&self) -> bool {
        self.reset.is_empty() && self.failed.is_empty()
    }
}

#[derive(Clone)]
pub struct Reaper {
    store: Arc<dyn JobStore>,
    audit: Arc<dyn AuditSink>,
    settings: ReaperSettings,
}

impl core::fmt::Debug for Reaper {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Reaper")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Reaper {
    pub fn new(store: Arc<dyn JobStore>, audit: Arc<dyn AuditSink>, settings: ReaperSettings) -> Self {
        Self {
            store,
            audit,
            settings,
        }
    }

    pub fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = i64::try_from(self.settings.stale_after_secs).unwrap_or(i64::MAX);
        let window = chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::MAX);
        now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// One sweep as of `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<ReapSummary, JobStoreError> {
        let stale_before = self.stale_before(now);
        let candidates = self.store.find_stale(stale_before).await?;
        let mut summary = ReapSummary::default();

        for job in candidates {
            let last_seen = job.last_seen();
            let action = match self
                .store
                .reap_stale(job.id, stale_before, STUCK_JOB_MESSAGE)
                .await
            {
                Ok(Some(action)) => action,
                // Finished, reclaimed or heartbeated since the scan.
                Ok(None) => continue,
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "failed to reap job");
                    continue;
                }
            };

            match action {
                ReapAction::Reset { retry_count } => {
                    warn!(
                        job_id = %job.id,
                        %last_seen,
                        retry_count,
                        max_retries = job.max_retries,
                        phase = job.current_phase.as_deref().unwrap_or("-"),
                        "stuck job reset to pending"
                    );
                    self.audit.append(
                        JobEvent::new(EventKind::SystemError, job.id).with_data(json!({
                            "reason": "stuck_job_reset",
                            "last_seen": last_seen,
                            "phase": job.current_phase,
                            "retry_count": retry_count,
                            "max_retries": job.max_retries,
                        })),
                    );
                    summary.reset.push(job.id);
                }
                ReapAction::Failed { retry_count } => {
                    error!(
                        job_id = %job.id,
                        %last_seen,
                        retry_count,
                        "stuck job failed; retries exhausted"
                    );
                    self.audit.append(
                        JobEvent::new(EventKind::JobFailed, job.id).with_data(json!({
                            "error": STUCK_JOB_MESSAGE,
                            "phase": job.current_phase,
                            "retry_count": retry_count,
                        })),
                    );
                    summary.failed.push(job.id);
                }
            }
        }

        if !summary.is_empty() {
            info!(reset = summary.reset.len(), failed = summary.failed.len(), "reaper sweep finished");
        }
        Ok(summary)
    }

    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let reaper = self.clone();
        let interval = Duration::from_secs(self.settings.interval_secs.max(1));
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "reaper started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(err) = reaper.sweep_at(Utc::now()).await {
                    error!(error = %err, "reaper sweep failed");
                }
            }
            info!("reaper stopped");
        })
    }
}
