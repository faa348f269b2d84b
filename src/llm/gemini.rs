//! Gemini provider (Google generateContent shape)

use super::{excerpt, Completion, CompletionClient, CompletionRequest, LlmError, REQUEST_TIMEOUT};
use serde::Deserialize;
use std::sync::OnceLock;

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiClient {
    /// Built lazily on the calling worker thread; a blocking reqwest client
    /// must not be constructed on the async intake runtime.
    client: OnceLock<reqwest::blocking::Client>,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl GeminiClient {
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

    fn parse_response(body: &str) -> Result<Completion, LlmError> {
        let parsed: GenerateContentResponse = serde_json::from_str(body)
            .map_err(|e| LlmError::Internal(format!("Failed to parse response: {}", e)))?;

        // Concatenate all text parts of the first candidate
        let content = parsed
            .candidates
            .into_iter()
            .next()
            .map(|c| {
                c.content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        // Gemini reports prompt and candidate counts separately
        let total_tokens = parsed
            .usage_metadata
            .map(|u| u.prompt_token_count + u.candidates_token_count)
            .unwrap_or(0);

        Ok(Completion {
            content,
            total_tokens,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: CandidateContent,
}

#[derive(Debug, Deserialize, Default)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: i64,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: i64,
}

impl CompletionClient for GeminiClient {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let api_key = self.api_key.as_deref().ok_or(LlmError::AuthMissing {
            provider: "gemini",
        })?;

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url.trim_end_matches('/'),
            self.model,
            api_key
        );

        let response = self
            .http()
            .post(&url)
            .json(&serde_json::json!({
                "contents": [{"parts": [{"text": request.prompt}]}],
                "generationConfig": {
                    "temperature": request.temperature,
                    "maxOutputTokens": request.max_tokens,
                },
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_sums_token_counts() {
        let body = r#"{
            "candidates": [
                {"content": {"parts": [{"text": "<summary>"}, {"text": "</summary>"}]}}
            ],
            "usageMetadata": {"promptTokenCount": 300, "candidatesTokenCount": 45}
        }"#;

        let completion = GeminiClient::parse_response(body).unwrap();
        assert_eq!(completion.content, "<summary></summary>");
        assert_eq!(completion.total_tokens, 345);
    }

    #[test]
    fn test_parse_response_no_candidates() {
        let completion = GeminiClient::parse_response(r#"{"candidates": []}"#).unwrap();
        assert_eq!(completion.content, "");
        assert_eq!(completion.total_tokens, 0);
    }

    #[test]
    fn test_missing_api_key_is_auth_error() {
        let client = GeminiClient::new(None, "gemini-2.0-flash".to_string());
        let err = client
            .complete(&CompletionRequest::new("hi".to_string(), 16))
            .unwrap_err();
        assert!(matches!(err, LlmError::AuthMissing { .. }));
    }
}
