use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// One generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Model id or preset understood by the backend.
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// Cost reported by the backend itself (e.g. OpenRouter `usage.cost`).
    pub cost: Option<f64>,
    /// Model that actually served the request.
    pub model: String,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    #[error("backend call timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode backend response: {0}")]
    Decode(String),

    #[error("backend misconfigured: {0}")]
    Config(String),
}

impl BackendError {
    /// Worth another attempt: timeouts, transport errors, 408/429/5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Timeout(_) | BackendError::Network(_) => true,
            BackendError::Status { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            BackendError::Decode(_) | BackendError::Config(_) => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            BackendError::Timeout(_) | BackendError::Status { status: 408, .. }
        )
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout(err.to_string())
        } else if err.is_decode() {
            BackendError::Decode(err.to_string())
        } else {
            BackendError::Network(err.to_string())
        }
    }
}

/// A backend family able to serve chat completions.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Backend family name, for logs.
    fn name(&self) -> &str;

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, BackendError>;
}
