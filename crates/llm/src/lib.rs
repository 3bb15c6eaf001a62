//! `scriptorium-llm`
//!
//! **Responsibility:** Generation-backend boundary.
//!
//! The engine never builds HTTP requests itself. It talks to a
//! [`GenerationBackend`], picked by name from a [`BackendRegistry`] that is
//! built from configuration at process start.

pub mod anthropic;
pub mod backend;
pub mod openai;
pub mod registry;
pub mod scripted;

pub use anthropic::AnthropicBackend;
pub use backend::{BackendError, ChatMessage, ChatRequest, ChatResponse, GenerationBackend, Role};
pub use openai::OpenAiCompatibleBackend;
pub use registry::{BackendConfig, BackendKind, BackendRegistry};
pub use scripted::{ScriptStep, ScriptedBackend};
