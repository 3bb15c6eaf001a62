//! Engine settings.
//!
//! Loaded from an optional YAML file, then `SCRIPTORIUM__`-prefixed environment
//! variables with `__` between path segments, e.g.
//! `SCRIPTORIUM__DISPATCHER__MAX_CONCURRENT_JOBS=4`. A `.env` file is read first.
//! Every section has defaults, so the engine starts with no file at all.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use scriptorium_core::{
    CostGuardConfig, DurationThreshold, PipelineDefinition, PriceTable, TierConfig, TierRouter,
};
use scriptorium_llm::{BackendConfig, BackendKind};
use scriptorium_observability::LoggingSettings;

use crate::dispatcher::DispatcherSettings;
use crate::pipeline::EscalationSettings;
use crate::reaper::ReaperSettings;

/// Looked up (without extension) when no explicit path is given.
pub const DEFAULT_CONFIG_FILE: &str = "config/scriptorium";
pub const ENV_PREFIX: &str = "SCRIPTORIUM";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactSettings {
    /// Per-job output directories live under this root.
    pub root: PathBuf,
    /// Source transcripts are read from here by key.
    pub inbox: PathBuf,
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/artifacts"),
            inbox: PathBuf::from("data/inbox"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Postgres URL. Unset: in-memory store (jobs do not survive a restart).
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub artifacts: ArtifactSettings,
    pub dispatcher: DispatcherSettings,
    pub reaper: ReaperSettings,
    pub pipeline: PipelineDefinition,
    /// Cheapest first.
    pub tiers: Vec<TierConfig>,
    pub duration_thresholds: Vec<DurationThreshold>,
    pub escalation: EscalationSettings,
    pub cost_guard: CostGuardConfig,
    pub prices: PriceTable,
    pub backends: IndexMap<String, BackendConfig>,
    pub logging: LoggingSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let mut backends = IndexMap::new();
        backends.insert(
            "openrouter".to_string(),
            BackendConfig {
                kind: BackendKind::OpenaiCompatible,
                base_url: "https://openrouter.ai/api/v1".to_string(),
                api_key_env: Some("OPENROUTER_API_KEY".to_string()),
            },
        );

        Self {
            database_url: None,
            database_max_connections: 5,
            artifacts: ArtifactSettings::default(),
            dispatcher: DispatcherSettings::default(),
            reaper: ReaperSettings::default(),
            pipeline: PipelineDefinition::default(),
            tiers: vec![
                TierConfig::new("cheap", "openrouter", "openai/gpt-4o-mini"),
                TierConfig::new("default", "openrouter", "anthropic/claude-3.5-haiku"),
                TierConfig::new("premium", "openrouter", "anthropic/claude-3.5-sonnet")
                    .with_timeout_secs(300),
            ],
            duration_thresholds: vec![
                DurationThreshold::up_to(15.0, 0),
                DurationThreshold::up_to(30.0, 1),
                DurationThreshold::unbounded(2),
            ],
            escalation: EscalationSettings::default(),
            cost_guard: CostGuardConfig::default(),
            prices: PriceTable::default(),
            backends,
            logging: LoggingSettings::default(),
        }
    }
}

impl EngineSettings {
    /// Read `.env`, the settings file and the environment, then validate.
    ///
    /// With `path`, the file must exist; otherwise `config/scriptorium.{yaml,...}`
    /// is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        dotenvy::dotenv().ok();

        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let settings: EngineSettings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.tiers.is_empty() {
            return Err(invalid("no tiers configured"));
        }
        if self.pipeline.is_empty() {
            return Err(invalid("pipeline has no phases"));
        }
        self.router()?;

        let mut labels = HashSet::new();
        for tier in &self.tiers {
            if !self.backends.contains_key(&tier.backend) {
                return Err(invalid(format!(
                    "tier {} uses unknown backend {}",
                    tier.label, tier.backend
                )));
            }
            if !labels.insert(tier.label.as_str()) {
                return Err(invalid(format!("duplicate tier label {}", tier.label)));
            }
            if tier.timeout_secs == 0 {
                return Err(invalid(format!("tier {} has a zero timeout", tier.label)));
            }
        }

        if self.dispatcher.max_concurrent_jobs == 0 {
            return Err(invalid("dispatcher.max_concurrent_jobs must be at least 1"));
        }
        if self.escalation.max_retries_per_tier == 0 {
            return Err(invalid("escalation.max_retries_per_tier must be at least 1"));
        }
        if self.reaper.stale_after_secs <= self.dispatcher.heartbeat_interval_secs {
            return Err(invalid(format!(
                "reaper.stale_after_secs ({}) must exceed dispatcher.heartbeat_interval_secs ({})",
                self.reaper.stale_after_secs, self.dispatcher.heartbeat_interval_secs
            )));
        }
        if self.cost_guard.max_cost_per_run < 0.0 {
            return Err(invalid("cost_guard.max_cost_per_run must be >= 0"));
        }
        Ok(())
    }

    /// Router over the configured tiers, thresholds and pipeline.
    pub fn router(&self) -> Result<TierRouter, SettingsError> {
        TierRouter::new(
            self.tiers.clone(),
            self.duration_thresholds.clone(),
            &self.pipeline,
        )
        .map_err(|e| invalid(e.to_string()))
    }
}

fn invalid(message: impl Into<String>) -> SettingsError {
    SettingsError::Invalid(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriptorium_core::PhaseSpec;

    const SAMPLE: &str = r#"
database_url: postgres://localhost/scriptorium
dispatcher:
  max_concurrent_jobs: 4
tiers:
  - label: small
    backend: local
    model: small-model
  - label: large
    backend: local
    model: large-model
    timeout_secs: 600
duration_thresholds:
  - max_minutes: 20.0
    min_tier: 0
  - min_tier: 1
pipeline:
  - name: analyst
    system_prompt: Analyse the transcript.
  - name: copy_editor
    base_tier: 1
    uses_source: false
backends:
  local:
    kind: openai_compatible
    base_url: http://localhost:8080/v1
cost_guard:
  max_cost_per_run: 1.5
  model_allowlist: [small-model, large-model]
"#;

    fn write_sample(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "scriptorium-settings-{}.yaml",
            uuid::Uuid::now_v7()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn defaults_are_valid() {
        let settings = EngineSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.router().unwrap().top_tier(), 2);
    }

    #[test]
    fn loads_yaml_over_defaults() {
        let path = write_sample(SAMPLE);
        let settings = EngineSettings::load(Some(&path)).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(
            settings.database_url.as_deref(),
            Some("postgres://localhost/scriptorium")
        );
        assert_eq!(settings.dispatcher.max_concurrent_jobs, 4);
        assert_eq!(settings.dispatcher.poll_interval_ms, 1_000);
        assert_eq!(settings.tiers.len(), 2);
        assert_eq!(settings.tiers[1].timeout_secs, 600);
        assert_eq!(
            settings.pipeline.names().collect::<Vec<_>>(),
            vec!["analyst", "copy_editor"]
        );
        assert!(!settings.pipeline.get("copy_editor").unwrap().uses_source);
        assert_eq!(settings.cost_guard.max_cost_per_run, 1.5);
        assert!(settings.cost_guard.enforce_allowlist);
        assert_eq!(settings.reaper, ReaperSettings::default());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let missing = std::env::temp_dir().join("scriptorium-does-not-exist.yaml");
        assert!(matches!(
            EngineSettings::load(Some(&missing)),
            Err(SettingsError::Load(_))
        ));
    }

    #[test]
    fn rejects_inconsistent_settings() {
        let unknown_backend = EngineSettings {
            tiers: vec![TierConfig::new("t", "nowhere", "m")],
            duration_thresholds: vec![],
            pipeline: PipelineDefinition::new(vec![PhaseSpec::new("a", 0)]),
            ..Default::default()
        };
        assert!(unknown_backend.validate().is_err());

        let tier_out_of_range = EngineSettings {
            pipeline: PipelineDefinition::new(vec![PhaseSpec::new("a", 5)]),
            ..Default::default()
        };
        assert!(tier_out_of_range.validate().is_err());

        let duplicate_phase = EngineSettings {
            pipeline: PipelineDefinition::new(vec![PhaseSpec::new("a", 0), PhaseSpec::new("a", 1)]),
            ..Default::default()
        };
        assert!(duplicate_phase.validate().is_err());

        let mut no_workers = EngineSettings::default();
        no_workers.dispatcher.max_concurrent_jobs = 0;
        assert!(no_workers.validate().is_err());

        let mut no_attempts = EngineSettings::default();
        no_attempts.escalation.max_retries_per_tier = 0;
        assert!(no_attempts.validate().is_err());

        let mut eager_reaper = EngineSettings::default();
        eager_reaper.reaper.stale_after_secs = 30;
        assert!(eager_reaper.validate().is_err());

        let no_tiers = EngineSettings {
            tiers: vec![],
            ..Default::default()
        };
        assert!(matches!(no_tiers.validate(), Err(SettingsError::Invalid(msg)) if msg.contains("no tiers")));
    }
}
