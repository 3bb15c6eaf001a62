//! Pipeline definition: the fixed, ordered list of phases per deployment.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::phase::Phase;

fn default_true() -> bool {
    true
}

/// Configuration of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    /// Tier used when nothing else raises it.
    #[serde(default)]
    pub base_tier: usize,
    #[serde(default)]
    pub system_prompt: String,
    /// Overrides the tier's `max_tokens`.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Content-integrity rule: output chars / source chars must reach this ratio.
    #[serde(default)]
    pub min_output_ratio: Option<f64>,
    /// Whether the source transcript is part of the prompt.
    #[serde(default = "default_true")]
    pub uses_source: bool,
    /// Disabled phases are recorded as skipped and produce no artifact.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl PhaseSpec {
    pub fn new(name: impl Into<String>, base_tier: usize) -> Self {
        Self {
            name: name.into(),
            base_tier,
            system_prompt: String::new(),
            max_tokens: None,
            min_output_ratio: None,
            uses_source: true,
            enabled: true,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_min_output_ratio(mut self, ratio: f64) -> Self {
        self.min_output_ratio = Some(ratio);
        self
    }

    pub fn without_source(mut self) -> Self {
        self.uses_source = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Artifact name for this phase's output.
    pub fn artifact_name(&self) -> String {
        format!("{}.md", self.name)
    }
}

/// Ordered phase list. The order is configuration, not engine logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineDefinition {
    phases: Vec<PhaseSpec>,
}

impl Default for PipelineDefinition {
    fn default() -> Self {
        Self::new(vec![
            PhaseSpec::new("analyst", 0).with_prompt(
                "Analyse the transcript. List speakers, topics and key claims with timestamps.",
            ),
            PhaseSpec::new("formatter", 0)
                .with_prompt(
                    "Rewrite the transcript as clean, readable prose. Keep every statement; do not summarise.",
                )
                .with_min_output_ratio(0.6),
            PhaseSpec::new("seo", 0)
                .with_prompt("Write a title, a description and keywords for the formatted article.")
                .without_source(),
            PhaseSpec::new("copy_editor", 1)
                .with_prompt("Copy-edit the formatted article. Fix grammar and style only.")
                .without_source(),
        ])
    }
}

impl PipelineDefinition {
    pub fn new(phases: Vec<PhaseSpec>) -> Self {
        Self { phases }
    }

    pub fn phases(&self) -> &[PhaseSpec] {
        &self.phases
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.phases.iter().map(|p| p.name.as_str())
    }

    /// Check names are unique and every base tier exists.
    pub fn validate(&self, tier_count: usize) -> DomainResult<()> {
        if self.phases.is_empty() {
            return Err(DomainError::validation("pipeline has no phases"));
        }

        let mut seen = HashSet::new();
        for spec in &self.phases {
            if spec.name.trim().is_empty() {
                return Err(DomainError::validation("phase name is empty"));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(DomainError::validation(format!(
                    "duplicate phase name: {}",
                    spec.name
                )));
            }
            if spec.base_tier >= tier_count {
                return Err(DomainError::validation(format!(
                    "phase {} has base tier {} but only {} tiers are configured",
                    spec.name, spec.base_tier, tier_count
                )));
            }
            if let Some(ratio) = spec.min_output_ratio {
                if !(0.0..=10.0).contains(&ratio) {
                    return Err(DomainError::validation(format!(
                        "phase {} has invalid min_output_ratio {ratio}",
                        spec.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Phase records in pipeline order, reusing existing records by name.
    ///
    /// Records for names no longer in the pipeline are dropped.
    pub fn align(&self, existing: &[Phase]) -> Vec<Phase> {
        self.phases
            .iter()
            .map(|spec| {
                existing
                    .iter()
                    .find(|p| p.name == spec.name)
                    .cloned()
                    .unwrap_or_else(|| Phase::new(spec.name.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn default_pipeline_is_valid() {
        let pipeline = PipelineDefinition::default();
        assert!(pipeline.validate(3).is_ok());
        assert_eq!(
            pipeline.names().collect::<Vec<_>>(),
            vec!["analyst", "formatter", "seo", "copy_editor"]
        );
    }

    #[test]
    fn rejects_duplicates_and_out_of_range_tiers() {
        let dup = PipelineDefinition::new(vec![PhaseSpec::new("a", 0), PhaseSpec::new("a", 0)]);
        assert!(dup.validate(1).is_err());

        let high = PipelineDefinition::new(vec![PhaseSpec::new("a", 3)]);
        assert!(high.validate(3).is_err());

        assert!(PipelineDefinition::new(vec![]).validate(1).is_err());
    }

    #[test]
    fn align_keeps_records_and_pipeline_order() {
        let pipeline = PipelineDefinition::new(vec![
            PhaseSpec::new("a", 0),
            PhaseSpec::new("b", 0),
            PhaseSpec::new("c", 0),
        ]);
        let mut b = Phase::new("b");
        b.mark_skipped(Utc::now());
        let stale = Phase::new("removed");

        let aligned = pipeline.align(&[b.clone(), stale]);

        assert_eq!(
            aligned.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert_eq!(aligned[1], b);
    }
}
