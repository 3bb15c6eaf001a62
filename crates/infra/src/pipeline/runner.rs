//! One run of a job through the configured phases.

use std::sync::Arc;

use chrono::Utc;
use indexmap::IndexMap;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use scriptorium_core::{
    AttemptRecord, Job, JobId, JobStatus, Phase, PhaseCompletion, PhaseSpec, PhaseStatus,
    PipelineDefinition, RunCostTracker, TierRouter, archive_interrupted,
};
use scriptorium_events::{AuditSink, EventKind, JobEvent};
use scriptorium_llm::ChatMessage;

use super::error::PipelineError;
use super::escalation::Escalator;
use super::manifest::{MANIFEST_NAME, Manifest};
use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::jobs::{JobStore, JobStoreError};

/// How a run ended when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { manifest: Manifest },
    /// The job left `in_progress` (cancelled, paused) between phases.
    Stopped { status: JobStatus },
    /// The job was reaped or claimed again; nothing more was written.
    Abandoned,
}

/// Runs jobs phase by phase.
///
/// Completed phases are never recomputed: their artifacts are loaded into the
/// context for downstream phases instead.
#[derive(Clone)]
pub struct PhasePipeline {
    definition: PipelineDefinition,
    escalator: Escalator,
    store: Arc<dyn JobStore>,
    artifacts: Arc<dyn ArtifactStore>,
    audit: Arc<dyn AuditSink>,
}

impl core::fmt::Debug for PhasePipeline {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PhasePipeline")
            .field("phases", &self.definition.names().collect::<Vec<_>>())
            .field("escalator", &self.escalator)
            .finish_non_exhaustive()
    }
}

impl PhasePipeline {
    pub fn new(
        definition: PipelineDefinition,
        escalator: Escalator,
        store: Arc<dyn JobStore>,
        artifacts: Arc<dyn ArtifactStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            definition,
            escalator,
            store,
            artifacts,
            audit,
        }
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub fn router(&self) -> &TierRouter {
        self.escalator.router()
    }

    /// Run `job` under the lease it was claimed with.
    ///
    /// `lost` is cancelled when the claim is lost; an in-flight call is then
    /// dropped and the run ends as `Abandoned`.
    #[instrument(skip(self, job, tracker, lost), fields(job_id = %job.id, lease = job.lease))]
    pub async fn run(
        &self,
        job: &Job,
        tracker: &mut RunCostTracker,
        lost: &CancellationToken,
    ) -> Result<RunOutcome, PipelineError> {
        let source = self.artifacts.read_source(&job.source).await?;
        let mut phases = self.definition.align(&job.phases);
        let mut context: IndexMap<String, String> = IndexMap::new();

        let interrupted = archive_interrupted(&mut phases, Utc::now());
        if !interrupted.is_empty() {
            info!(phases = ?interrupted, "archived phases left in progress by an earlier run");
            if let Some(outcome) = self.persist(job, &phases, None).await? {
                return Ok(outcome);
            }
        }

        for (index, spec) in self.definition.phases().iter().enumerate() {
            if let Some(outcome) = self.checkpoint(job, lost, &spec.name).await? {
                return Ok(outcome);
            }

            let phase = &mut phases[index];

            if phase.is_completed() {
                let name = phase.artifact.clone().unwrap_or_else(|| spec.artifact_name());
                match self.artifacts.read(job.id, &name).await? {
                    Some(content) => {
                        debug!(phase = %spec.name, "phase already completed; reusing artifact");
                        context.insert(spec.name.clone(), content);
                        continue;
                    }
                    None => {
                        return Err(PipelineError::Truncated {
                            phase: spec.name.clone(),
                            detail: format!("completed phase is missing its artifact {name}"),
                        });
                    }
                }
            }

            if !spec.enabled {
                if phase.status != PhaseStatus::Skipped {
                    phase.mark_skipped(Utc::now());
                    if let Some(outcome) = self.persist(job, &phases, None).await? {
                        return Ok(outcome);
                    }
                    self.emit(job.id, EventKind::PhaseSkipped, json!({ "phase": spec.name }));
                }
                continue;
            }

            phase.mark_in_progress(Utc::now());
            let phase_retry = phase.retry_count;
            if let Some(outcome) = self.persist(job, &phases, Some(&spec.name)).await? {
                return Ok(outcome);
            }
            self.emit(
                job.id,
                EventKind::PhaseStarted,
                json!({ "phase": spec.name, "phase_retry": phase_retry }),
            );

            let decision = self
                .router()
                .select_tier(&spec.name, job.duration_minutes, job.tier_override)?
                .with_floor(job.min_tier);
            debug!(phase = %spec.name, tier = decision.tier, reason = %decision.reason, "tier selected");

            let messages = build_messages(spec, &source, &context);
            let result = tokio::select! {
                biased;
                _ = lost.cancelled() => {
                    warn!(phase = %spec.name, "claim lost during phase call; abandoning run");
                    return Ok(RunOutcome::Abandoned);
                }
                result = self.escalator.call(job.id, spec, decision.tier, messages, tracker) => result,
            };
            let call = match result {
                Ok(call) => call,
                Err(err) => {
                    let history = err.attempts().to_vec();
                    return Err(self.fail_phase(job, &mut phases, index, err, history).await);
                }
            };
            if let Err(err) = check_integrity(spec, &source, &call.content) {
                // The call itself succeeded and was paid for.
                phases[index].cost += call.cost;
                phases[index].tokens += call.tokens;
                return Err(self.fail_phase(job, &mut phases, index, err, call.history).await);
            }

            let artifact = spec.artifact_name();
            self.artifacts.write(job.id, &artifact, &call.content).await?;

            let mut reason = decision.reason;
            for escalation in &call.escalations {
                reason.push_str("; ");
                reason.push_str(escalation);
            }
            let completion = PhaseCompletion {
                tier: call.tier,
                tier_label: self.router().label(call.tier).to_string(),
                model: call.model,
                cost: call.cost,
                tokens: call.tokens,
                history: call.history,
                artifact: artifact.clone(),
                reason,
            };
            let attempts = completion.history.len();
            phases[index].mark_completed(completion, Utc::now());
            if let Some(outcome) = self.persist(job, &phases, Some(&spec.name)).await? {
                return Ok(outcome);
            }
            self.emit(
                job.id,
                EventKind::PhaseCompleted,
                json!({
                    "phase": spec.name,
                    "tier": call.tier,
                    "tier_label": self.router().label(call.tier),
                    "attempts": attempts,
                    "cost": call.cost,
                    "tokens": call.tokens,
                    "artifact": artifact,
                }),
            );
            context.insert(spec.name.clone(), call.content);
        }

        if let Some(outcome) = self.checkpoint(job, lost, "manifest").await? {
            return Ok(outcome);
        }
        let manifest = Manifest::build(job.id, &job.source, &phases, tracker, Utc::now());
        let body = manifest
            .to_json()
            .map_err(|e| ArtifactError::Io(std::io::Error::from(e)))?;
        self.artifacts.write(job.id, MANIFEST_NAME, &body).await?;
        if let Some(outcome) = self.persist(job, &phases, None).await? {
            return Ok(outcome);
        }

        info!(
            run_cost = tracker.total_cost(),
            run_calls = tracker.call_count(),
            "pipeline completed"
        );
        Ok(RunOutcome::Completed { manifest })
    }

    /// `Some` when the run must stop before `next`: lease lost, or the job
    /// left `in_progress`.
    async fn checkpoint(
        &self,
        job: &Job,
        lost: &CancellationToken,
        next: &str,
    ) -> Result<Option<RunOutcome>, PipelineError> {
        if lost.is_cancelled() {
            return Ok(Some(RunOutcome::Abandoned));
        }
        let current = self.store.get(job.id).await?;
        if current.lease != job.lease {
            warn!(next, lease = current.lease, "job was claimed again; abandoning run");
            return Ok(Some(RunOutcome::Abandoned));
        }
        if current.status != JobStatus::InProgress {
            info!(next, status = %current.status, "job left in_progress; stopping");
            return Ok(Some(RunOutcome::Stopped {
                status: current.status,
            }));
        }
        Ok(None)
    }

    async fn fail_phase(
        &self,
        job: &Job,
        phases: &mut [Phase],
        index: usize,
        err: PipelineError,
        history: Vec<AttemptRecord>,
    ) -> PipelineError {
        let attempts = history.len();
        phases[index].mark_failed(err.to_string(), history, Utc::now());
        let name = phases[index].name.clone();
        match self.persist(job, phases, Some(&name)).await {
            Ok(None) => {}
            Ok(Some(_)) => warn!(phase = %name, "phase failure not recorded: lease lost"),
            Err(store_err) => warn!(phase = %name, error = %store_err, "failed to record phase failure"),
        }
        self.emit(
            job.id,
            EventKind::PhaseFailed,
            json!({ "phase": name, "error": err.to_string(), "attempts": attempts }),
        );
        err
    }

    /// Write the phase list under the job's lease. `Some(Abandoned)` once it is lost.
    async fn persist(
        &self,
        job: &Job,
        phases: &[Phase],
        current: Option<&str>,
    ) -> Result<Option<RunOutcome>, PipelineError> {
        match self
            .store
            .record_phases(job.id, job.lease, phases, current)
            .await
        {
            Ok(()) => Ok(None),
            Err(JobStoreError::LeaseLost(_)) => Ok(Some(RunOutcome::Abandoned)),
            Err(err) => Err(err.into()),
        }
    }

    fn emit(&self, id: JobId, kind: EventKind, data: serde_json::Value) {
        self.audit.append(JobEvent::new(kind, id).with_data(data));
    }
}

/// System prompt, then the source (when the phase reads it), then every
/// upstream artifact in pipeline order.
fn build_messages(
    spec: &PhaseSpec,
    source: &str,
    context: &IndexMap<String, String>,
) -> Vec<ChatMessage> {
    let mut sections = Vec::with_capacity(context.len() + 1);
    if spec.uses_source {
        sections.push(format!("## Source\n\n{source}"));
    }
    for (name, content) in context {
        sections.push(format!("## {name}\n\n{content}"));
    }
    if sections.is_empty() {
        sections.push("(no input)".to_string());
    }

    let mut messages = Vec::with_capacity(2);
    if !spec.system_prompt.is_empty() {
        messages.push(ChatMessage::system(spec.system_prompt.clone()));
    }
    messages.push(ChatMessage::user(sections.join("\n\n")));
    messages
}

/// Output shorter than `min_output_ratio` of the source counts as truncated.
fn check_integrity(spec: &PhaseSpec, source: &str, output: &str) -> Result<(), PipelineError> {
    let Some(ratio) = spec.min_output_ratio else {
        return Ok(());
    };
    let source_chars = source.chars().count();
    if source_chars == 0 {
        return Ok(());
    }
    let output_chars = output.chars().count();
    let actual = output_chars as f64 / source_chars as f64;
    if actual < ratio {
        return Err(PipelineError::Truncated {
            phase: spec.name.clone(),
            detail: format!(
                "output is {output_chars} chars for a {source_chars}-char source (ratio {actual:.2}, minimum {ratio:.2})"
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use scriptorium_core::{
        CostGuard, CostGuardConfig, DurationThreshold, NewJob, PriceTable, TierConfig,
    };
    use scriptorium_events::InMemoryAuditSink;
    use scriptorium_llm::{
        BackendError, BackendRegistry, ChatRequest, ChatResponse, GenerationBackend, ScriptStep,
        ScriptedBackend,
    };

    use crate::artifacts::InMemoryArtifactStore;
    use crate::jobs::{InMemoryJobStore, StatusUpdate};
    use crate::pipeline::retry::{EscalationSettings, RetryPolicy};

    struct Harness {
        pipeline: PhasePipeline,
        store: Arc<InMemoryJobStore>,
        artifacts: Arc<InMemoryArtifactStore>,
        backend: Arc<ScriptedBackend>,
        audit: Arc<InMemoryAuditSink>,
    }

    /// What happens to the running job while the first call is in flight.
    enum DuringCall {
        Pause,
        /// Reap and re-claim the job, cancel `lost`, then never answer.
        Reclaim(CancellationToken),
    }

    struct InterferingBackend {
        store: Arc<InMemoryJobStore>,
        inner: Arc<ScriptedBackend>,
        action: DuringCall,
        fired: AtomicBool,
    }

    #[async_trait]
    impl GenerationBackend for InterferingBackend {
        fn name(&self) -> &str {
            "interfering"
        }

        async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, BackendError> {
            if !self.fired.swap(true, Ordering::SeqCst) {
                let running = self.store.list(Some(JobStatus::InProgress), 10).await.unwrap();
                match &self.action {
                    DuringCall::Pause => {
                        for job in running {
                            self.store
                                .update_status(job.id, StatusUpdate::to(JobStatus::Paused))
                                .await
                                .unwrap();
                        }
                    }
                    DuringCall::Reclaim(lost) => {
                        let cutoff = Utc::now() + chrono::Duration::hours(1);
                        for job in running {
                            self.store.reap_stale(job.id, cutoff, "stuck").await.unwrap();
                        }
                        self.store.claim_next_pending().await.unwrap().unwrap();
                        lost.cancel();
                        return std::future::pending().await;
                    }
                }
            }
            self.inner.chat(request).await
        }
    }

    fn harness(definition: PipelineDefinition) -> Harness {
        harness_with(definition, None)
    }

    fn harness_with(definition: PipelineDefinition, action: Option<DuringCall>) -> Harness {
        let tiers = vec![
            TierConfig::new("cheap", "scripted", "model-0"),
            TierConfig::new("default", "scripted", "model-1"),
            TierConfig::new("premium", "scripted", "model-2"),
        ];
        let router =
            TierRouter::new(tiers, vec![DurationThreshold::unbounded(0)], &definition).unwrap();
        let store = Arc::new(InMemoryJobStore::new());
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        let backend = Arc::new(ScriptedBackend::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        let generation: Arc<dyn GenerationBackend> = match action {
            None => backend.clone(),
            Some(action) => Arc::new(InterferingBackend {
                store: store.clone(),
                inner: backend.clone(),
                action,
                fired: AtomicBool::new(false),
            }),
        };
        let escalator = Escalator::new(
            Arc::new(router),
            BackendRegistry::new().with("scripted", generation),
            CostGuard::new(CostGuardConfig::disabled(), PriceTable::default()),
            EscalationSettings {
                backoff: RetryPolicy::immediate(),
                ..Default::default()
            },
            audit.clone(),
        );
        let pipeline = PhasePipeline::new(
            definition,
            escalator,
            store.clone(),
            artifacts.clone(),
            audit.clone(),
        );
        Harness {
            pipeline,
            store,
            artifacts,
            backend,
            audit,
        }
    }

    fn two_phases() -> PipelineDefinition {
        PipelineDefinition::new(vec![
            PhaseSpec::new("analyst", 0).with_prompt("analyse"),
            PhaseSpec::new("seo", 0).with_prompt("tag").without_source(),
        ])
    }

    async fn claimed(h: &Harness) -> Job {
        h.artifacts.add_source("ep-1", "the transcript");
        h.store.enqueue(NewJob::new("ep-1")).await.unwrap();
        h.store.claim_next_pending().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn runs_phases_in_order_and_writes_manifest() {
        let h = harness(two_phases());
        let job = claimed(&h).await;
        h.backend.push("model-0", ScriptStep::reply("analysis"));
        h.backend.push("model-0", ScriptStep::reply("tags"));

        let mut tracker = RunCostTracker::new(job.id, Utc::now());
        let outcome = h.pipeline.run(&job, &mut tracker, &CancellationToken::new()).await.unwrap();

        let RunOutcome::Completed { manifest } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(manifest.phases.len(), 2);
        assert_eq!(manifest.run.calls, 2);
        assert_eq!(h.artifacts.names(job.id), vec!["analyst.md", "manifest.json", "seo.md"]);

        let calls = h.backend.calls();
        let seo_input = &calls[1].messages[1].content;
        assert!(seo_input.contains("## analyst\n\nanalysis"));
        assert!(!seo_input.contains("the transcript"));

        let stored = h.store.get(job.id).await.unwrap();
        assert!(stored.phases.iter().all(Phase::is_completed));
        assert_eq!(stored.current_phase, None);
        assert_eq!(h.audit.count(EventKind::PhaseCompleted), 2);
    }

    #[tokio::test]
    async fn stops_between_phases_when_cancelled() {
        let h = harness(two_phases());
        let job = claimed(&h).await;
        h.store
            .update_status(job.id, StatusUpdate::to(JobStatus::Cancelled))
            .await
            .unwrap();

        let mut tracker = RunCostTracker::new(job.id, Utc::now());
        let outcome = h.pipeline.run(&job, &mut tracker, &CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Stopped {
                status: JobStatus::Cancelled
            }
        );
        assert_eq!(h.backend.call_count(), 0);
    }

    #[tokio::test]
    async fn disabled_phase_is_skipped() {
        let definition = PipelineDefinition::new(vec![
            PhaseSpec::new("analyst", 0),
            PhaseSpec::new("seo", 0).disabled(),
        ]);
        let h = harness(definition);
        let job = claimed(&h).await;

        let mut tracker = RunCostTracker::new(job.id, Utc::now());
        h.pipeline.run(&job, &mut tracker, &CancellationToken::new()).await.unwrap();

        let stored = h.store.get(job.id).await.unwrap();
        assert_eq!(stored.phase("seo").unwrap().status, PhaseStatus::Skipped);
        assert_eq!(h.backend.call_count(), 1);
        assert_eq!(h.audit.count(EventKind::PhaseSkipped), 1);
    }

    #[tokio::test]
    async fn short_output_is_a_truncation() {
        let definition = PipelineDefinition::new(vec![
            PhaseSpec::new("formatter", 0).with_min_output_ratio(0.9),
        ]);
        let h = harness(definition);
        let job = claimed(&h).await;
        h.backend.push("model-0", ScriptStep::reply("tiny"));

        let mut tracker = RunCostTracker::new(job.id, Utc::now());
        let err = h.pipeline.run(&job, &mut tracker, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Truncated { ref phase, .. } if phase == "formatter"));

        let stored = h.store.get(job.id).await.unwrap();
        assert_eq!(stored.phase("formatter").unwrap().status, PhaseStatus::Failed);
        assert_eq!(h.artifacts.names(job.id), Vec::<String>::new());
    }

    #[tokio::test]
    async fn pause_during_a_call_keeps_the_paid_result() {
        let h = harness_with(two_phases(), Some(DuringCall::Pause));
        let job = claimed(&h).await;
        h.backend.push("model-0", ScriptStep::reply_with_cost("analysis", 0.2));

        let mut tracker = RunCostTracker::new(job.id, Utc::now());
        let outcome = h.pipeline.run(&job, &mut tracker, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Stopped { status: JobStatus::Paused });

        let paused = h.store.get(job.id).await.unwrap();
        let analyst = paused.phase("analyst").unwrap();
        assert_eq!(analyst.status, PhaseStatus::Completed);
        assert!((analyst.cost - 0.2).abs() < 1e-9);
        assert_eq!(h.artifacts.names(job.id), vec!["analyst.md"]);

        h.store
            .update_status(
                job.id,
                StatusUpdate::to(JobStatus::Pending)
                    .only_from(&[JobStatus::Paused])
                    .archiving_interrupted(),
            )
            .await
            .unwrap();
        let resumed = h.store.claim_next_pending().await.unwrap().unwrap();
        h.backend.push("model-0", ScriptStep::reply("tags"));
        let mut tracker = RunCostTracker::new(job.id, Utc::now());
        let outcome = h.pipeline.run(&resumed, &mut tracker, &CancellationToken::new()).await.unwrap();

        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert_eq!(h.backend.call_count(), 2);
        let done = h.store.get(job.id).await.unwrap();
        assert!(done.phase("analyst").unwrap().previous_runs.is_empty());
        assert!(done.phases.iter().all(Phase::is_completed));
    }

    #[tokio::test]
    async fn phase_left_in_progress_is_archived_before_rerun() {
        let h = harness(two_phases());
        let job = claimed(&h).await;
        let mut phases = h.pipeline.definition().align(&job.phases);
        phases[0].mark_in_progress(Utc::now());
        phases[0].tier = Some(1);
        h.store
            .record_phases(job.id, job.lease, &phases, Some("analyst"))
            .await
            .unwrap();
        let job = h.store.get(job.id).await.unwrap();

        let mut tracker = RunCostTracker::new(job.id, Utc::now());
        h.pipeline.run(&job, &mut tracker, &CancellationToken::new()).await.unwrap();

        let analyst = h.store.get(job.id).await.unwrap().phase("analyst").unwrap().clone();
        assert_eq!(analyst.status, PhaseStatus::Completed);
        assert_eq!(analyst.previous_runs.len(), 1);
        assert_eq!(analyst.previous_runs[0].status, PhaseStatus::InProgress);
        assert_eq!(analyst.previous_runs[0].tier, Some(1));
    }

    #[tokio::test]
    async fn lost_claim_abandons_the_call_and_writes_nothing() {
        let lost = CancellationToken::new();
        let h = harness_with(two_phases(), Some(DuringCall::Reclaim(lost.clone())));
        let job = claimed(&h).await;

        let mut tracker = RunCostTracker::new(job.id, Utc::now());
        let outcome = h.pipeline.run(&job, &mut tracker, &lost).await.unwrap();
        assert_eq!(outcome, RunOutcome::Abandoned);

        let current = h.store.get(job.id).await.unwrap();
        assert_eq!(current.status, JobStatus::InProgress);
        assert_eq!(current.lease, job.lease + 2);
        assert_eq!(current.retry_count, 1);
        assert_eq!(h.artifacts.names(job.id), Vec::<String>::new());
        assert_eq!(h.audit.count(EventKind::PhaseCompleted), 0);
    }

    #[test]
    fn messages_put_source_before_upstream_artifacts() {
        let mut context = IndexMap::new();
        context.insert("analyst".to_string(), "A".to_string());
        context.insert("formatter".to_string(), "F".to_string());

        let spec = PhaseSpec::new("seo", 0).with_prompt("sys");
        let messages = build_messages(&spec, "SRC", &context);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "sys");
        assert_eq!(
            messages[1].content,
            "## Source\n\nSRC\n\n## analyst\n\nA\n\n## formatter\n\nF"
        );
    }
}
