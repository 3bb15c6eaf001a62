use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scriptorium_core::{JobId, Phase, PhaseStatus, RunCostTracker};

pub const MANIFEST_NAME: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestPhase {
    pub name: String,
    pub status: PhaseStatus,
    pub tier: Option<usize>,
    pub tier_label: Option<String>,
    pub model: Option<String>,
    pub attempts: u32,
    pub cost: f64,
    pub tokens: u64,
    pub artifact: Option<String>,
}

/// Totals for the run that produced the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTotals {
    pub cost: f64,
    pub tokens: u64,
    pub calls: u32,
}

/// Summary written next to the phase artifacts when a job completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub job_id: JobId,
    pub source: String,
    pub generated_at: DateTime<Utc>,
    pub phases: Vec<ManifestPhase>,
    /// Sum of the cost recorded on every phase, resumed phases included.
    pub phase_cost: f64,
    pub run: RunTotals,
}

impl Manifest {
    pub fn build(
        job_id: JobId,
        source: &str,
        phases: &[Phase],
        tracker: &RunCostTracker,
        now: DateTime<Utc>,
    ) -> Self {
        let phases: Vec<ManifestPhase> = phases
            .iter()
            .map(|p| ManifestPhase {
                name: p.name.clone(),
                status: p.status,
                tier: p.tier,
                tier_label: p.tier_label.clone(),
                model: p.model.clone(),
                attempts: p.attempts,
                cost: p.cost,
                tokens: p.tokens,
                artifact: p.artifact.clone(),
            })
            .collect();

        Self {
            job_id,
            source: source.to_string(),
            generated_at: now,
            phase_cost: phases.iter().map(|p| p.cost).sum(),
            phases,
            run: RunTotals {
                cost: tracker.total_cost(),
                tokens: tracker.total_tokens(),
                calls: tracker.call_count(),
            },
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
