//! Named backends built from configuration.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::anthropic::AnthropicBackend;
use crate::backend::{BackendError, GenerationBackend};
use crate::openai::OpenAiCompatibleBackend;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    OpenaiCompatible,
    Anthropic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub base_url: String,
    /// Environment variable holding the API key. Never the key itself.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl BackendConfig {
    fn api_key(&self, name: &str) -> Result<Option<String>, BackendError> {
        match &self.api_key_env {
            None => Ok(None),
            Some(var) => std::env::var(var).map(Some).map_err(|_| {
                BackendError::Config(format!(
                    "backend {name}: environment variable {var} is not set"
                ))
            }),
        }
    }
}

#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn GenerationBackend>>,
}

impl core::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut names: Vec<&String> = self.backends.keys().collect();
        names.sort();
        f.debug_struct("BackendRegistry").field("backends", &names).finish()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: &IndexMap<String, BackendConfig>) -> Result<Self, BackendError> {
        let mut registry = Self::new();
        for (name, config) in configs {
            let backend: Arc<dyn GenerationBackend> = match config.kind {
                BackendKind::OpenaiCompatible => Arc::new(OpenAiCompatibleBackend::new(
                    &config.base_url,
                    config.api_key(name)?,
                )),
                BackendKind::Anthropic => {
                    let key = config.api_key(name)?.ok_or_else(|| {
                        BackendError::Config(format!("backend {name}: anthropic requires api_key_env"))
                    })?;
                    Arc::new(AnthropicBackend::new(&config.base_url, key))
                }
            };
            info!(backend = %name, kind = ?config.kind, base_url = %config.base_url, "registered backend");
            registry.backends.insert(name.clone(), backend);
        }
        Ok(registry)
    }

    pub fn register(&mut self, name: impl Into<String>, backend: Arc<dyn GenerationBackend>) {
        self.backends.insert(name.into(), backend);
    }

    pub fn with(mut self, name: impl Into<String>, backend: Arc<dyn GenerationBackend>) -> Self {
        self.register(name, backend);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn GenerationBackend>> {
        self.backends.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }
}
