//! Deterministic backend for tests and dry runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::backend::{BackendError, ChatRequest, ChatResponse, GenerationBackend, Role};

/// One scripted outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    Reply { content: String, cost: Option<f64> },
    Fail(BackendError),
}

impl ScriptStep {
    pub fn reply(content: impl Into<String>) -> Self {
        ScriptStep::Reply {
            content: content.into(),
            cost: None,
        }
    }

    pub fn reply_with_cost(content: impl Into<String>, cost: f64) -> Self {
        ScriptStep::Reply {
            content: content.into(),
            cost: Some(cost),
        }
    }

    pub fn timeout() -> Self {
        ScriptStep::Fail(BackendError::Timeout("scripted timeout".to_string()))
    }

    pub fn server_error() -> Self {
        ScriptStep::Fail(BackendError::Status {
            status: 503,
            body: "scripted outage".to_string(),
        })
    }
}

/// Replays queued steps per model, then a model-agnostic queue, then echoes
/// the user messages back.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    by_model: Mutex<HashMap<String, VecDeque<ScriptStep>>>,
    any: Mutex<VecDeque<ScriptStep>>,
    calls: Mutex<Vec<ChatRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, model: impl Into<String>, step: ScriptStep) -> &Self {
        if let Ok(mut by_model) = self.by_model.lock() {
            by_model.entry(model.into()).or_default().push_back(step);
        }
        self
    }

    pub fn push_any(&self, step: ScriptStep) -> &Self {
        if let Ok(mut any) = self.any.lock() {
            any.push_back(step);
        }
        self
    }

    /// Every request received, in order.
    pub fn calls(&self) -> Vec<ChatRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }

    pub fn models_called(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.model).collect()
    }

    fn next_step(&self, model: &str) -> Option<ScriptStep> {
        let scripted = self
            .by_model
            .lock()
            .ok()
            .and_then(|mut by_model| by_model.get_mut(model).and_then(VecDeque::pop_front));
        scripted.or_else(|| self.any.lock().ok().and_then(|mut any| any.pop_front()))
    }
}

fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4).max(1)
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, BackendError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }

        let (content, cost) = match self.next_step(&request.model) {
            Some(ScriptStep::Fail(err)) => return Err(err),
            Some(ScriptStep::Reply { content, cost }) => (content, cost),
            None => {
                let echoed: Vec<&str> = request
                    .messages
                    .iter()
                    .filter(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .collect();
                (echoed.join("\n"), None)
            }
        };

        let prompt: String = request.messages.iter().map(|m| m.content.as_str()).collect();
        let input_tokens = estimate_tokens(&prompt);
        let output_tokens = estimate_tokens(&content);
        Ok(ChatResponse {
            content,
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            cost,
            model: request.model,
        })
    }
}
