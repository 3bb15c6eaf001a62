//! The per-phase call loop: cost guard, bounded attempts per tier, escalation.
//!
//! ```text
//! tier = selected
//! loop:
//!     repeat up to attempts_per_tier:
//!         cost guard (fails closed, never retried)
//!         call backend under the tier's timeout
//!         ok        -> charge, record, return
//!         permanent -> fail
//!         transient -> back off, try again
//!     escalates(last failure) and next_tier(tier) exists -> tier = next
//!     otherwise -> exhausted
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use scriptorium_core::{
    AttemptRecord, CostGuard, JobId, PhaseSpec, RunCostTracker, TierConfig, TierRouter, Usage,
};
use scriptorium_events::{AuditSink, EventKind, JobEvent};
use scriptorium_llm::{BackendError, BackendRegistry, ChatMessage, ChatRequest, ChatResponse};

use super::error::PipelineError;
use super::retry::EscalationSettings;

/// Result of a successful phase call.
#[derive(Debug, Clone)]
pub struct PhaseCall {
    pub content: String,
    pub tier: usize,
    /// Model that actually served the call.
    pub model: String,
    pub cost: f64,
    pub tokens: u64,
    /// Every attempt, the successful one last.
    pub history: Vec<AttemptRecord>,
    /// One line per tier change.
    pub escalations: Vec<String>,
}

/// Issues backend calls for phases.
#[derive(Clone)]
pub struct Escalator {
    router: Arc<TierRouter>,
    backends: BackendRegistry,
    guard: CostGuard,
    settings: EscalationSettings,
    audit: Arc<dyn AuditSink>,
}

impl core::fmt::Debug for Escalator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Escalator")
            .field("backends", &self.backends)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Escalator {
    pub fn new(
        router: Arc<TierRouter>,
        backends: BackendRegistry,
        guard: CostGuard,
        settings: EscalationSettings,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            router,
            backends,
            guard,
            settings,
            audit,
        }
    }

    pub fn router(&self) -> &TierRouter {
        &self.router
    }

    pub async fn call(
        &self,
        job_id: JobId,
        spec: &PhaseSpec,
        start_tier: usize,
        messages: Vec<ChatMessage>,
        tracker: &mut RunCostTracker,
    ) -> Result<PhaseCall, PipelineError> {
        let phase = spec.name.as_str();
        let mut tier = start_tier.min(self.router.top_tier());
        let mut history: Vec<AttemptRecord> = Vec::new();
        let mut escalations = Vec::new();

        loop {
            let config = self.tier_config(phase, tier, &history)?;
            let mut last_error = None;

            for attempt in 1..=self.settings.attempts_per_tier() {
                if let Err(source) = self.guard.check_call(tracker, &config.model) {
                    warn!(job_id = %job_id, phase, tier, model = %config.model, error = %source, "cost guard blocked call");
                    return Err(PipelineError::Safety {
                        phase: phase.to_string(),
                        source,
                        attempts: history,
                    });
                }

                let request = ChatRequest {
                    messages: messages.clone(),
                    model: config.model.clone(),
                    max_tokens: spec.max_tokens.unwrap_or(config.max_tokens),
                    temperature: config.temperature,
                };

                debug!(job_id = %job_id, phase, tier, attempt, model = %config.model, "calling backend");
                match self.send(config, request).await {
                    Ok(response) => {
                        let usage = Usage {
                            model: response.model.clone(),
                            input_tokens: response.input_tokens,
                            output_tokens: response.output_tokens,
                            total_tokens: response.total_tokens,
                            reported_cost: response.cost,
                        };
                        let cost = self.guard.charge(&usage);
                        tracker.record(cost, response.total_tokens);
                        history.push(AttemptRecord {
                            tier,
                            tier_label: config.label.clone(),
                            model: response.model.clone(),
                            error: None,
                            timed_out: false,
                            at: Utc::now(),
                        });
                        info!(
                            job_id = %job_id,
                            phase,
                            tier,
                            model = %response.model,
                            cost,
                            tokens = response.total_tokens,
                            attempts = history.len(),
                            "phase call succeeded"
                        );
                        return Ok(PhaseCall {
                            content: response.content,
                            tier,
                            model: response.model,
                            cost,
                            tokens: response.total_tokens,
                            history,
                            escalations,
                        });
                    }
                    Err(err) => {
                        history.push(AttemptRecord {
                            tier,
                            tier_label: config.label.clone(),
                            model: config.model.clone(),
                            error: Some(err.to_string()),
                            timed_out: err.is_timeout(),
                            at: Utc::now(),
                        });
                        warn!(job_id = %job_id, phase, tier, attempt, error = %err, "backend call failed");

                        if !err.is_transient() {
                            return Err(PipelineError::Backend {
                                phase: phase.to_string(),
                                attempts: history,
                                source: err,
                            });
                        }
                        if attempt < self.settings.attempts_per_tier() {
                            let delay = self.settings.backoff.delay_for_attempt(attempt);
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                        }
                        last_error = Some(err);
                    }
                }
            }

            let Some(last_error) = last_error else {
                // attempts_per_tier() >= 1, so every exit from the loop above set an error.
                return Err(PipelineError::Exhausted {
                    phase: phase.to_string(),
                    last_error: BackendError::Config("no attempt was made".to_string()),
                    attempts: history,
                });
            };

            let next = self
                .settings
                .escalates(last_error.is_timeout())
                .then(|| self.router.next_tier(tier))
                .flatten();
            let Some(next) = next else {
                warn!(job_id = %job_id, phase, tier, attempts = history.len(), "escalation exhausted");
                return Err(PipelineError::Exhausted {
                    phase: phase.to_string(),
                    attempts: history,
                    last_error,
                });
            };

            let cause = if last_error.is_timeout() { "timeout" } else { "failure" };
            let reason = format!(
                "escalated from tier {tier} ({}) to tier {next} ({}) after {} {cause}(s): {last_error}",
                self.router.label(tier),
                self.router.label(next),
                self.settings.attempts_per_tier(),
            );
            info!(job_id = %job_id, phase, from = tier, to = next, "{reason}");
            self.audit.append(JobEvent::new(EventKind::TierEscalated, job_id).with_data(json!({
                "phase": phase,
                "from_tier": tier,
                "to_tier": next,
                "reason": reason,
            })));
            escalations.push(reason);
            tier = next;
        }
    }

    fn tier_config(
        &self,
        phase: &str,
        tier: usize,
        history: &[AttemptRecord],
    ) -> Result<&TierConfig, PipelineError> {
        self.router.tier(tier).ok_or_else(|| PipelineError::Backend {
            phase: phase.to_string(),
            attempts: history.to_vec(),
            source: BackendError::Config(format!("tier {tier} is not configured")),
        })
    }

    async fn send(&self, config: &TierConfig, request: ChatRequest) -> Result<ChatResponse, BackendError> {
        let backend = self.backends.get(&config.backend).ok_or_else(|| {
            BackendError::Config(format!("unknown backend {}", config.backend))
        })?;
        let limit = Duration::from_secs(config.timeout_secs);
        match tokio::time::timeout(limit, backend.chat(request)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(format!(
                "no response within {}s",
                config.timeout_secs
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriptorium_core::{
        CostGuardConfig, DurationThreshold, ModelPrice, PipelineDefinition, PriceTable,
    };
    use scriptorium_events::InMemoryAuditSink;
    use scriptorium_llm::{ScriptStep, ScriptedBackend};

    use crate::pipeline::retry::RetryPolicy;

    struct Fixture {
        escalator: Escalator,
        backend: Arc<ScriptedBackend>,
        audit: Arc<InMemoryAuditSink>,
    }

    fn fixture(settings: EscalationSettings, guard: CostGuardConfig) -> Fixture {
        let tiers = vec![
            TierConfig::new("cheap", "scripted", "model-0"),
            TierConfig::new("default", "scripted", "model-1"),
            TierConfig::new("premium", "scripted", "model-2"),
        ];
        let pipeline = PipelineDefinition::new(vec![PhaseSpec::new("analyst", 0)]);
        let router = TierRouter::new(tiers, vec![DurationThreshold::unbounded(0)], &pipeline).unwrap();
        let backend = Arc::new(ScriptedBackend::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        let prices = PriceTable::default().with_model("model-2", ModelPrice::new(1.0, 1.0));
        let escalator = Escalator::new(
            Arc::new(router),
            BackendRegistry::new().with("scripted", backend.clone()),
            CostGuard::new(guard, prices),
            EscalationSettings {
                backoff: RetryPolicy::immediate(),
                ..settings
            },
            audit.clone(),
        );
        Fixture {
            escalator,
            backend,
            audit,
        }
    }

    fn messages() -> Vec<ChatMessage> {
        vec![ChatMessage::system("sys"), ChatMessage::user("source")]
    }

    fn tracker() -> RunCostTracker {
        RunCostTracker::new(JobId::new(1), Utc::now())
    }

    #[tokio::test]
    async fn retries_within_tier_before_escalating() {
        let f = fixture(EscalationSettings::default(), CostGuardConfig::disabled());
        f.backend.push("model-0", ScriptStep::server_error());
        f.backend.push("model-0", ScriptStep::timeout());
        f.backend.push("model-1", ScriptStep::reply("done"));

        let mut tracker = tracker();
        let call = f
            .escalator
            .call(JobId::new(1), &PhaseSpec::new("analyst", 0), 0, messages(), &mut tracker)
            .await
            .unwrap();

        assert_eq!(call.tier, 1);
        assert_eq!(call.content, "done");
        assert_eq!(call.history.len(), 3);
        assert!(call.history[1].timed_out);
        assert!(call.history[2].succeeded());
        assert_eq!(f.backend.models_called(), vec!["model-0", "model-0", "model-1"]);
        assert_eq!(f.audit.count(EventKind::TierEscalated), 1);
        assert_eq!(tracker.call_count(), 1);
    }

    #[tokio::test]
    async fn never_skips_a_tier_and_stops_at_the_top() {
        let settings = EscalationSettings {
            max_retries_per_tier: 1,
            ..Default::default()
        };
        let f = fixture(settings, CostGuardConfig::disabled());
        for _ in 0..3 {
            f.backend.push_any(ScriptStep::server_error());
        }

        let err = f
            .escalator
            .call(JobId::new(1), &PhaseSpec::new("analyst", 0), 0, messages(), &mut tracker())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Exhausted { .. }));
        let tiers: Vec<usize> = err.attempts().iter().map(|a| a.tier).collect();
        assert_eq!(tiers, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn timeout_escalation_can_be_switched_off() {
        let settings = EscalationSettings {
            max_retries_per_tier: 1,
            escalate_on_timeout: false,
            ..Default::default()
        };
        let f = fixture(settings, CostGuardConfig::disabled());
        f.backend.push("model-0", ScriptStep::timeout());

        let err = f
            .escalator
            .call(JobId::new(1), &PhaseSpec::new("analyst", 0), 0, messages(), &mut tracker())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Exhausted { ref last_error, .. } if last_error.is_timeout()));
        assert_eq!(f.backend.call_count(), 1);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let f = fixture(EscalationSettings::default(), CostGuardConfig::disabled());
        f.backend.push(
            "model-0",
            ScriptStep::Fail(BackendError::Status {
                status: 400,
                body: "bad request".to_string(),
            }),
        );

        let err = f
            .escalator
            .call(JobId::new(1), &PhaseSpec::new("analyst", 0), 0, messages(), &mut tracker())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Backend { .. }));
        assert_eq!(f.backend.call_count(), 1);
    }

    #[tokio::test]
    async fn cost_guard_fails_closed_before_any_call() {
        let guard = CostGuardConfig {
            max_cost_per_1k_tokens: 0.5,
            ..Default::default()
        };
        let f = fixture(EscalationSettings::default(), guard);

        let err = f
            .escalator
            .call(JobId::new(1), &PhaseSpec::new("analyst", 2), 2, messages(), &mut tracker())
            .await
            .unwrap_err();
        assert!(err.is_safety_violation());
        assert_eq!(f.backend.call_count(), 0);
    }

    #[tokio::test]
    async fn self_reported_cost_is_charged_to_the_run() {
        let f = fixture(EscalationSettings::default(), CostGuardConfig::disabled());
        f.backend.push("model-0", ScriptStep::reply_with_cost("ok", 0.25));

        let mut tracker = tracker();
        let call = f
            .escalator
            .call(JobId::new(1), &PhaseSpec::new("analyst", 0), 0, messages(), &mut tracker)
            .await
            .unwrap();
        assert_eq!(call.cost, 0.25);
        assert_eq!(tracker.total_cost(), 0.25);
    }
}
