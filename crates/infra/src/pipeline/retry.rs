//! Backoff and escalation policy for backend calls.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// Delay between two attempts at the same tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    /// Cap applied before jitter.
    pub max_delay_ms: u64,
    /// 0.0..=1.0
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Retry immediately.
    pub fn immediate() -> Self {
        Self::fixed(0)
    }

    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            jitter: 0.0,
        }
    }

    pub fn exponential(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms,
            max_delay_ms,
            jitter: 0.1,
        }
    }

    /// Delay after the given failed attempt (1-indexed). Attempt 0 never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.base_delay_ms == 0 {
            return Duration::ZERO;
        }

        let base = self.base_delay_ms as f64;
        let cap = self.max_delay_ms.max(self.base_delay_ms) as f64;
        let delay = match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Exponential => (base * 2_f64.powi((attempt - 1).min(30) as i32)).min(cap),
            BackoffStrategy::Linear => (base * f64::from(attempt)).min(cap),
        };

        // Deterministic spread so concurrent workers do not retry in lockstep.
        let range = delay * self.jitter.clamp(0.0, 1.0);
        let spread = if range > 0.0 {
            let unit = (f64::from(attempt) * 17.0 % 100.0) / 100.0;
            range * (unit - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay + spread).max(0.0) as u64)
    }
}

/// How a phase reacts to failed backend calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationSettings {
    /// Off: one attempt at the selected tier, then fail.
    pub enabled: bool,
    /// Attempts at one tier before moving up. Must be at least 1.
    pub max_retries_per_tier: u32,
    pub escalate_on_failure: bool,
    pub escalate_on_timeout: bool,
    pub backoff: RetryPolicy,
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries_per_tier: 2,
            escalate_on_failure: true,
            escalate_on_timeout: true,
            backoff: RetryPolicy::default(),
        }
    }
}

impl EscalationSettings {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn attempts_per_tier(&self) -> u32 {
        if self.enabled {
            self.max_retries_per_tier.max(1)
        } else {
            1
        }
    }

    /// Whether a tier whose last attempt failed this way may hand over to the next one.
    pub fn escalates(&self, timed_out: bool) -> bool {
        self.enabled
            && if timed_out {
                self.escalate_on_timeout
            } else {
                self.escalate_on_failure
            }
    }
}
