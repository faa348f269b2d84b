//! OpenRouter provider (OpenAI chat-completions shape)

use super::{excerpt, Completion, CompletionClient, CompletionRequest, LlmError, REQUEST_TIMEOUT};
use serde::Deserialize;
use std::sync::OnceLock;

const DEFAULT_API_BASE: &str = "https://openrouter.ai/api/v1";

pub struct OpenRouterClient {
    /// Built lazily on the calling worker thread; a blocking reqwest client
    /// must not be constructed on the async intake runtime.
    client: OnceLock<reqwest::blocking::Client>,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenRouterClient {
    pub fn new(api_key: Option<String>, model: String) -> Self {
        Self {
            client: OnceLock::new(),
            base_url: DEFAULT_API_BASE.to_string(),
            api_key,
            model,
        }
    }

    fn http(&self) -> &reqwest::blocking::Client {
        self.client.get_or_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default()
        })
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn parse_response(body: &str) -> Result<Completion, LlmError> {
        let parsed: ChatCompletionResponse = serde_json::from_str(body)
            .map_err(|e| LlmError::Internal(format!("Failed to parse response: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(Completion {
            content,
            total_tokens: parsed.usage.map(|u| u.total_tokens).unwrap_or(0),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    total_tokens: i64,
}

impl CompletionClient for OpenRouterClient {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let api_key = self.api_key.as_deref().ok_or(LlmError::AuthMissing {
            provider: "openrouter",
        })?;

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .http()
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&serde_json::json!({
                "model": self.model,
                "messages": [{"role": "user", "content": request.prompt}],
                "temperature": request.temperature,
                "max_tokens": request.max_tokens,
            }))
            .send()
            .map_err(LlmError::from_reqwest)?;

        let status = response.status();
        let body = response.text().map_err(LlmError::from_reqwest)?;

        if !status.is_success() {
            return Err(LlmError::Upstream {
                status: status.as_u16(),
                message: excerpt(&body),
            });
        }

        Self::parse_response(&body)
    }
}
