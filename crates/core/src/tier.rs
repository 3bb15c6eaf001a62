//! Tier routing: which backend configuration a phase runs on.
//!
//! Tiers are ordered by cost/capability, tier 0 being the cheapest. The router
//! is a pure decision function; it returns the tier together with a short
//! reason so every decision can be audited.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::pipeline::PipelineDefinition;

fn default_max_tokens() -> u32 {
    8192
}

fn default_temperature() -> f32 {
    0.3
}

fn default_timeout_secs() -> u64 {
    300
}

/// One backend configuration in the tier ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Human-readable name (e.g. "cheap", "default", "premium").
    pub label: String,
    /// Name of the backend in the backend registry.
    pub backend: String,
    /// Model id or preset passed to the backend.
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Per-call timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl TierConfig {
    pub fn new(label: impl Into<String>, backend: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            backend: backend.into(),
            model: model.into(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Duration threshold: sources up to `max_minutes` need at least `min_tier`.
///
/// `max_minutes: None` is the unbounded catch-all.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationThreshold {
    pub max_minutes: Option<f64>,
    pub min_tier: usize,
}

impl DurationThreshold {
    pub fn up_to(max_minutes: f64, min_tier: usize) -> Self {
        Self {
            max_minutes: Some(max_minutes),
            min_tier,
        }
    }

    pub fn unbounded(min_tier: usize) -> Self {
        Self {
            max_minutes: None,
            min_tier,
        }
    }
}

/// A routing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierDecision {
    pub tier: usize,
    pub reason: String,
}

impl TierDecision {
    /// Raise the decision to `floor` when it is below it.
    pub fn with_floor(self, floor: Option<usize>) -> Self {
        match floor {
            Some(floor) if floor > self.tier => TierDecision {
                tier: floor,
                reason: format!(
                    "{}; raised to tier {floor} by job retry escalation",
                    self.reason
                ),
            },
            _ => self,
        }
    }
}

/// Maps (phase, duration context, explicit override) to a tier.
#[derive(Debug, Clone, PartialEq)]
pub struct TierRouter {
    tiers: Vec<TierConfig>,
    /// Ascending by `max_minutes`, catch-all last.
    thresholds: Vec<DurationThreshold>,
    base_tiers: HashMap<String, usize>,
}

impl TierRouter {
    pub fn new(
        tiers: Vec<TierConfig>,
        mut thresholds: Vec<DurationThreshold>,
        pipeline: &PipelineDefinition,
    ) -> DomainResult<Self> {
        if tiers.is_empty() {
            return Err(DomainError::validation("no tiers configured"));
        }

        if thresholds.iter().filter(|t| t.max_minutes.is_none()).count() > 1 {
            return Err(DomainError::validation(
                "more than one unbounded duration threshold",
            ));
        }
        for threshold in &thresholds {
            if threshold.min_tier >= tiers.len() {
                return Err(DomainError::validation(format!(
                    "duration threshold maps to tier {} but only {} tiers are configured",
                    threshold.min_tier,
                    tiers.len()
                )));
            }
            if threshold.max_minutes.is_some_and(|m| m.is_nan() || m < 0.0) {
                return Err(DomainError::validation("duration threshold must be >= 0"));
            }
        }
        thresholds.sort_by(|a, b| match (a.max_minutes, b.max_minutes) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => core::cmp::Ordering::Less,
            (None, Some(_)) => core::cmp::Ordering::Greater,
            (None, None) => core::cmp::Ordering::Equal,
        });

        pipeline.validate(tiers.len())?;
        let base_tiers = pipeline
            .phases()
            .iter()
            .map(|spec| (spec.name.clone(), spec.base_tier))
            .collect();

        Ok(Self {
            tiers,
            thresholds,
            base_tiers,
        })
    }

    pub fn tiers(&self) -> &[TierConfig] {
        &self.tiers
    }

    pub fn tier(&self, index: usize) -> Option<&TierConfig> {
        self.tiers.get(index)
    }

    pub fn top_tier(&self) -> usize {
        self.tiers.len() - 1
    }

    pub fn label(&self, index: usize) -> &str {
        self.tiers.get(index).map_or("unknown", |t| t.label.as_str())
    }

    /// Select the tier for a phase.
    ///
    /// An explicit override wins (clamped to the valid range). Otherwise the
    /// first threshold the duration satisfies raises the phase's base tier;
    /// without a duration the base tier is used unchanged.
    pub fn select_tier(
        &self,
        phase: &str,
        duration_minutes: Option<f64>,
        explicit_override: Option<usize>,
    ) -> DomainResult<TierDecision> {
        let base = *self
            .base_tiers
            .get(phase)
            .ok_or_else(|| DomainError::UnknownPhase(phase.to_string()))?;

        if let Some(requested) = explicit_override {
            let tier = requested.min(self.top_tier());
            let reason = if tier == requested {
                format!("explicit override to tier {tier} ({})", self.label(tier))
            } else {
                format!(
                    "explicit override to tier {requested} clamped to top tier {tier} ({})",
                    self.label(tier)
                )
            };
            return Ok(TierDecision { tier, reason });
        }

        let Some(minutes) = duration_minutes else {
            return Ok(TierDecision {
                tier: base,
                reason: format!("base tier {base} ({}) for {phase}", self.label(base)),
            });
        };

        let matched = self
            .thresholds
            .iter()
            .find(|t| t.max_minutes.is_none_or(|max| minutes <= max));

        let decision = match matched {
            Some(DurationThreshold {
                max_minutes: Some(max),
                min_tier,
            }) => {
                let tier = base.max(*min_tier);
                TierDecision {
                    tier,
                    reason: format!(
                        "duration {minutes:.1} min within {max:.1} min threshold (min tier {min_tier}); using tier {tier} ({})",
                        self.label(tier)
                    ),
                }
            }
            Some(DurationThreshold {
                max_minutes: None,
                min_tier,
            }) => {
                let tier = base.max(*min_tier);
                TierDecision {
                    tier,
                    reason: format!(
                        "duration {minutes:.1} min exceeds all bounded thresholds; catch-all min tier {min_tier}; using tier {tier} ({})",
                        self.label(tier)
                    ),
                }
            }
            None => TierDecision {
                tier: base,
                reason: format!(
                    "duration {minutes:.1} min exceeds all thresholds and no catch-all is configured; base tier {base} ({})",
                    self.label(base)
                ),
            },
        };
        Ok(decision)
    }

    /// The next tier up, `None` at the top. Escalation may only move through this.
    pub fn next_tier(&self, current: usize) -> Option<usize> {
        let next = current.checked_add(1)?;
        (next < self.tiers.len()).then_some(next)
    }
}
