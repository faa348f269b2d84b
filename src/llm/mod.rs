//! LLM completion client for the summarization workers
//!
//! Two provider backends share one blocking trait:
//!
//! ```text
//! CompletionClient trait
//! ├── OpenRouterClient (OpenAI chat-completions shape)
//! └── GeminiClient (Google generateContent shape)
//! ```
//!
//! # Sync Design
//!
//! Methods are synchronous because callers are the dedicated worker
//! threads; there is no async runtime on that side. The per-call deadline
//! is enforced by the blocking reqwest client's timeout - the remote is
//! never retried inside a call, all retries happen at the queue layer.

mod gemini;
mod openrouter;

pub use gemini::GeminiClient;
pub use openrouter::OpenRouterClient;

use std::fmt;
use std::time::Duration;

/// Hard per-call deadline. A summarization call that has not answered in a
/// minute is not going to.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Sampling temperature for all summarization calls
pub const TEMPERATURE: f32 = 0.3;

/// Output token budget for event summarization
pub const MAX_TOKENS_EVENTS: u32 = 4096;

/// Output token budget for session summaries
pub const MAX_TOKENS_SUMMARY: u32 = 2048;

/// A single completion request
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(prompt: String, max_tokens: u32) -> Self {
        Self {
            prompt,
            max_tokens,
            temperature: TEMPERATURE,
        }
    }
}

/// A completion result
///
/// `content` may be empty on a 2xx with no candidates - the client does not
/// distinguish that case; the parser will produce zero observations and the
/// worker treats the row as completed.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub total_tokens: i64,
}

/// Errors surfaced by completion calls
///
/// The workers treat every variant identically (mark the rows failed and
/// let the retry budget decide), but the distinction matters for logs.
#[derive(Debug)]
pub enum LlmError {
    /// No API key configured for the selected provider
    AuthMissing { provider: &'static str },
    /// Non-2xx from the provider, with a body excerpt
    Upstream { status: u16, message: String },
    /// The 60-second deadline elapsed
    Timeout,
    /// Connection-level failure
    Network(String),
    /// Unparseable response body
    Internal(String),
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthMissing { provider } => {
                write!(f, "No API key configured for provider '{}'", provider)
            }
            Self::Upstream { status, message } => {
                write!(f, "Upstream error ({}): {}", status, message)
            }
            Self::Timeout => write!(f, "LLM request timed out"),
            Self::Network(msg) => write!(f, "Network error: {}", msg),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for LlmError {}

impl LlmError {
    /// Map a transport error, distinguishing the deadline from plain
    /// connection failures.
    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// First few hundred bytes of an error body - enough to diagnose, small
/// enough to store in `error_message`.
pub(crate) fn excerpt(body: &str) -> String {
    crate::util::truncate_utf8_safe(body, 400).to_string()
}

/// Trait for completion providers
///
/// # Thread Safety
///
/// Providers must be `Send + Sync`; one boxed instance is shared by both
/// worker threads.
pub trait CompletionClient: Send + Sync {
    /// Human-readable name for logging
    fn name(&self) -> &'static str;

    /// Run one completion call against the provider.
    fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError>;
}

/// Provider settings as resolved from config
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// "openrouter" or "gemini"; anything else falls back to openrouter
    pub provider: String,
    pub openrouter_api_key: Option<String>,
    pub openrouter_model: String,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: "openrouter".to_string(),
            openrouter_api_key: None,
            openrouter_model: "openai/gpt-4o-mini".to_string(),
            gemini_api_key: None,
            gemini_model: "gemini-2.0-flash".to_string(),
        }
    }
}

/// Create a completion client from settings.
///
/// Unknown provider values fall back to openrouter rather than failing
/// startup - a typo in the config should not take the intake path down,
/// and a missing key surfaces as `AuthMissing` on first use anyway.
pub fn create_client(settings: &LlmSettings) -> Box<dyn CompletionClient> {
    match settings.provider.as_str() {
        "gemini" => Box::new(GeminiClient::new(
            settings.gemini_api_key.clone(),
            settings.gemini_model.clone(),
        )),
        "openrouter" => Box::new(OpenRouterClient::new(
            settings.openrouter_api_key.clone(),
            settings.openrouter_model.clone(),
        )),
        other => {
            tracing::warn!(
                provider = other,
                "Unknown LLM provider, falling back to openrouter"
            );
            Box::new(OpenRouterClient::new(
                settings.openrouter_api_key.clone(),
                settings.openrouter_model.clone(),
            ))
        }
    }
}
