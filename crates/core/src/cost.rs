//! Cost policy: pre-call guard checks, per-model prices and the per-run tracker.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::JobId;

/// Price of a model, in currency units per 1,000 tokens.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    /// Free-tier models are always charged zero.
    #[serde(default)]
    pub free: bool,
}

impl ModelPrice {
    pub fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
            free: false,
        }
    }

    pub fn free() -> Self {
        Self {
            input_per_1k: 0.0,
            output_per_1k: 0.0,
            free: true,
        }
    }

    /// Per-1k cost with input and output weighted 1:2.
    pub fn weighted_per_1k(&self) -> f64 {
        if self.free {
            return 0.0;
        }
        (self.input_per_1k + 2.0 * self.output_per_1k) / 3.0
    }

    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        if self.free {
            return 0.0;
        }
        (input_tokens as f64 / 1000.0) * self.input_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

fn default_unknown_price() -> ModelPrice {
    ModelPrice::new(0.015, 0.075)
}

/// Static per-model price table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTable {
    #[serde(default)]
    pub models: HashMap<String, ModelPrice>,
    /// Conservative price charged for models missing from the table.
    #[serde(default = "default_unknown_price")]
    pub unknown_model_price: ModelPrice,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            models: HashMap::new(),
            unknown_model_price: default_unknown_price(),
        }
    }
}

impl PriceTable {
    pub fn with_model(mut self, model: impl Into<String>, price: ModelPrice) -> Self {
        self.models.insert(model.into(), price);
        self
    }

    /// Exact id first, then the id without its `:variant` suffix.
    pub fn lookup(&self, model: &str) -> Option<&ModelPrice> {
        self.models.get(model).or_else(|| {
            model
                .split_once(':')
                .and_then(|(base, _)| self.models.get(base))
        })
    }

    pub fn is_free(&self, model: &str) -> bool {
        model.ends_with(":free") || self.models.get(model).is_some_and(|p| p.free)
    }

    /// Known per-1k weighted price; `None` when the model is unknown.
    pub fn weighted_per_1k(&self, model: &str) -> Option<f64> {
        if self.is_free(model) {
            return Some(0.0);
        }
        self.lookup(model).map(ModelPrice::weighted_per_1k)
    }

    /// Cost of a completed call.
    ///
    /// Free-tier models cost zero; otherwise the backend's own figure is used
    /// when present, then the table, then the conservative unknown-model price.
    pub fn charge(&self, usage: &Usage) -> f64 {
        if self.is_free(&usage.model) {
            return 0.0;
        }
        if let Some(reported) = usage.reported_cost {
            return reported.max(0.0);
        }
        self.lookup(&usage.model)
            .unwrap_or(&self.unknown_model_price)
            .cost(usage.input_tokens, usage.output_tokens)
    }
}

/// Token usage of one backend call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Model that actually served the call.
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// Cost reported by the backend itself, if any.
    pub reported_cost: Option<f64>,
}

fn default_enforce() -> bool {
    true
}

fn default_max_cost_per_run() -> f64 {
    5.0
}

fn default_max_cost_per_1k() -> f64 {
    0.1
}

/// Cost guard configuration. All checks default to enforced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostGuardConfig {
    /// Global switch; `false` disables every check.
    #[serde(default = "default_enforce")]
    pub enabled: bool,
    #[serde(default = "default_max_cost_per_run")]
    pub max_cost_per_run: f64,
    #[serde(default = "default_max_cost_per_1k")]
    pub max_cost_per_1k_tokens: f64,
    /// Empty means unrestricted.
    #[serde(default)]
    pub model_allowlist: Vec<String>,
    #[serde(default = "default_enforce")]
    pub enforce_run_cap: bool,
    #[serde(default = "default_enforce")]
    pub enforce_allowlist: bool,
    #[serde(default = "default_enforce")]
    pub enforce_token_cost: bool,
}

impl Default for CostGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_cost_per_run: default_max_cost_per_run(),
            max_cost_per_1k_tokens: default_max_cost_per_1k(),
            model_allowlist: Vec::new(),
            enforce_run_cap: true,
            enforce_allowlist: true,
            enforce_token_cost: true,
        }
    }
}

impl CostGuardConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// A cost policy violation. Never retried: retrying would not change the policy.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CostGuardError {
    #[error("run cost cap reached: spent {spent:.4} of {cap:.4}")]
    RunCapExceeded { spent: f64, cap: f64 },

    #[error("model not in allow-list: {model}")]
    ModelNotAllowed { model: String },

    #[error("model {model} costs {per_1k:.4} per 1k tokens, above the {ceiling:.4} ceiling")]
    TokenCostTooHigh {
        model: String,
        per_1k: f64,
        ceiling: f64,
    },
}

/// Pre-call checks, evaluated before any backend call is issued.
#[derive(Debug, Clone, PartialEq)]
pub struct CostGuard {
    config: CostGuardConfig,
    prices: PriceTable,
}

impl CostGuard {
    pub fn new(config: CostGuardConfig, prices: PriceTable) -> Self {
        Self { config, prices }
    }

    pub fn config(&self) -> &CostGuardConfig {
        &self.config
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    /// Fails once the run's accumulated cost has reached the cap.
    pub fn check_run_cap(&self, tracker: &RunCostTracker) -> Result<(), CostGuardError> {
        if !self.config.enabled || !self.config.enforce_run_cap {
            return Ok(());
        }
        if tracker.total_cost() >= self.config.max_cost_per_run {
            return Err(CostGuardError::RunCapExceeded {
                spent: tracker.total_cost(),
                cap: self.config.max_cost_per_run,
            });
        }
        Ok(())
    }

    /// Exact match or versioned variant (`allowed:...`) of an allow-listed model.
    pub fn check_allowlist(&self, model: &str) -> Result<(), CostGuardError> {
        if !self.config.enabled
            || !self.config.enforce_allowlist
            || self.config.model_allowlist.is_empty()
        {
            return Ok(());
        }
        let allowed = self.config.model_allowlist.iter().any(|allowed| {
            model == allowed
                || model
                    .strip_prefix(allowed.as_str())
                    .is_some_and(|rest| rest.starts_with(':'))
        });
        if allowed {
            Ok(())
        } else {
            Err(CostGuardError::ModelNotAllowed {
                model: model.to_string(),
            })
        }
    }

    /// Unknown models pass here; they are charged conservatively afterwards.
    pub fn check_token_cost(&self, model: &str) -> Result<(), CostGuardError> {
        if !self.config.enabled || !self.config.enforce_token_cost {
            return Ok(());
        }
        match self.prices.weighted_per_1k(model) {
            Some(per_1k) if per_1k > self.config.max_cost_per_1k_tokens => {
                Err(CostGuardError::TokenCostTooHigh {
                    model: model.to_string(),
                    per_1k,
                    ceiling: self.config.max_cost_per_1k_tokens,
                })
            }
            _ => Ok(()),
        }
    }

    /// All three checks, in order: run cap, allow-list, token cost.
    pub fn check_call(&self, tracker: &RunCostTracker, model: &str) -> Result<(), CostGuardError> {
        self.check_run_cap(tracker)?;
        self.check_allowlist(model)?;
        self.check_token_cost(model)
    }

    pub fn charge(&self, usage: &Usage) -> f64 {
        self.prices.charge(usage)
    }
}

/// Accumulates spend across every backend call of one job run.
///
/// Created when a job starts processing and summarised when it ends; passed
/// by reference, never shared globally.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCostTracker {
    job_id: JobId,
    started_at: DateTime<Utc>,
    total_cost: f64,
    total_tokens: u64,
    call_count: u32,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub job_id: JobId,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub call_count: u32,
    pub duration_ms: i64,
}

impl RunCostTracker {
    pub fn new(job_id: JobId, started_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            started_at,
            total_cost: 0.0,
            total_tokens: 0,
            call_count: 0,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    pub fn call_count(&self) -> u32 {
        self.call_count
    }

    pub fn record(&mut self, cost: f64, tokens: u64) {
        self.total_cost += cost;
        self.total_tokens += tokens;
        self.call_count += 1;
    }

    pub fn finish(self, now: DateTime<Utc>) -> RunSummary {
        RunSummary {
            job_id: self.job_id,
            total_cost: self.total_cost,
            total_tokens: self.total_tokens,
            call_count: self.call_count,
            duration_ms: (now - self.started_at).num_milliseconds().max(0),
        }
    }
}
