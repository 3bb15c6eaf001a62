//! OpenAI-compatible chat completions (OpenAI, OpenRouter, local servers).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{BackendError, ChatMessage, ChatRequest, ChatResponse, GenerationBackend};

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: Option<u64>,
    /// OpenRouter reports the billed amount here.
    #[serde(default)]
    cost: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct OpenAiCompatibleBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleBackend {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

fn into_chat_response(
    body: CompletionResponse,
    requested_model: &str,
) -> Result<ChatResponse, BackendError> {
    let content = body
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| BackendError::Decode("response has no message content".to_string()))?;
    let usage = body.usage.unwrap_or_default();
    Ok(ChatResponse {
        content,
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        total_tokens: usage
            .total_tokens
            .unwrap_or(usage.prompt_tokens + usage.completion_tokens),
        cost: usage.cost,
        model: body.model.unwrap_or_else(|| requested_model.to_string()),
    })
}

#[async_trait]
impl GenerationBackend for OpenAiCompatibleBackend {
    fn name(&self) -> &str {
        "openai_compatible"
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, BackendError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = CompletionRequest {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let mut builder = self.http.post(url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(BackendError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: CompletionResponse = response.json().await.map_err(BackendError::from_reqwest)?;
        let chat = into_chat_response(parsed, &request.model)?;
        debug!(
            model = %chat.model,
            input_tokens = chat.input_tokens,
            output_tokens = chat.output_tokens,
            reported_cost = ?chat.cost,
            "chat completion finished"
        );
        Ok(chat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_openrouter_usage_and_served_model() {
        let body: CompletionResponse = serde_json::from_value(serde_json::json!({
            "model": "vendor/model-a:2024",
            "choices": [{"message": {"role": "assistant", "content": "hello"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17, "cost": 0.0021}
        }))
        .unwrap();

        let chat = into_chat_response(body, "vendor/model-a").unwrap();
        assert_eq!(chat.content, "hello");
        assert_eq!(chat.total_tokens, 17);
        assert_eq!(chat.cost, Some(0.0021));
        assert_eq!(chat.model, "vendor/model-a:2024");
    }

    #[test]
    fn missing_usage_and_model_fall_back() {
        let body: CompletionResponse = serde_json::from_value(serde_json::json!({
            "choices": [{"message": {"content": "x"}}]
        }))
        .unwrap();

        let chat = into_chat_response(body, "local").unwrap();
        assert_eq!(chat.model, "local");
        assert_eq!(chat.total_tokens, 0);
        assert!(chat.cost.is_none());
    }

    #[test]
    fn empty_choices_is_a_decode_error() {
        let body: CompletionResponse =
            serde_json::from_value(serde_json::json!({"choices": []})).unwrap();
        assert!(matches!(
            into_chat_response(body, "m"),
            Err(BackendError::Decode(_))
        ));
    }
}
