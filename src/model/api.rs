//! Upstream chat-completion interface.
//!
//! `ModelApi` is the single narrow seam to the language model: an ordered
//! message list and an output cap in, text plus token counts out. The
//! production implementation speaks the Anthropic messages endpoint over
//! `reqwest`; tests script the trait directly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[async_trait]
pub trait ModelApi: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError>;
}

/// Classify a rendered error message as retry-forever material. The health
/// sweeper applies this to `last_error` strings long after the typed error
/// is gone.
pub fn is_transient_message(message: &str) -> bool {
    const MARKERS: &[&str] = &[
        "transient upstream",
        "overloaded",
        "rate limit",
        "too many requests",
        "529",
        "503",
        "connection reset",
        "socket",
        "timeout",
        "timed out",
        "network",
        "temporarily unavailable",
        "service unavailable",
        "capacity",
    ];
    let lower = message.to_lowercase();
    MARKERS.iter().any(|m| lower.contains(m))
}

/// HTTP client for the Anthropic messages endpoint.
pub struct AnthropicApi {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

const ANTHROPIC_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT_SECS: u64 = 300;

impl AnthropicApi {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, "https://api.anthropic.com")
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("reqwest client builder with static options");
        Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    /// Build from `ANTHROPIC_API_KEY`.
    pub fn from_env() -> Result<Self, ModelError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ModelError::permanent("ANTHROPIC_API_KEY is not set"))?;
        Ok(Self::new(api_key))
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait]
impl ModelApi for AnthropicApi {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::transient(format!("request timed out: {}", e))
                } else {
                    ModelError::transient(format!("network error: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("upstream returned {}: {}", status.as_u16(), truncate(&body, 300));
            // 429 and the 5xx family (including Anthropic's 529) are
            // capacity signals; everything else 4xx is on us.
            return if status.as_u16() == 429
                || status.as_u16() == 408
                || status.is_server_error()
                || status.as_u16() == 529
            {
                Err(ModelError::transient(message))
            } else {
                Err(ModelError::permanent(message))
            };
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ModelError::permanent(format!("unreadable response body: {}", e)))?;

        let text = parsed
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(ModelResponse {
            text,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_markers() {
        assert!(is_transient_message("Upstream 529 overloaded"));
        assert!(is_transient_message("Rate limit exceeded, retry later"));
        assert!(is_transient_message("connection reset by peer"));
        assert!(is_transient_message("request timed out after 300s"));
        assert!(is_transient_message("The service is temporarily unavailable"));
        assert!(is_transient_message("Transient upstream error: capacity"));
    }

    #[test]
    fn test_permanent_markers() {
        assert!(!is_transient_message("invalid api key"));
        assert!(!is_transient_message("Error: invalid JSON shape"));
        assert!(!is_transient_message("upstream returned 400: bad request"));
        assert!(!is_transient_message("missing required field 'chapter'"));
    }

    #[test]
    fn test_messages_response_decoding() {
        let raw = r#"{
            "content": [
                {"type": "text", "text": "Once upon "},
                {"type": "tool_use", "id": "x", "name": "y", "input": {}},
                {"type": "text", "text": "a tide."}
            ],
            "usage": {"input_tokens": 120, "output_tokens": 48}
        }"#;
        let parsed: MessagesResponse = serde_json::from_str(raw).unwrap();
        let text: String = parsed
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect();
        assert_eq!(text, "Once upon a tide.");
        assert_eq!(parsed.usage.input_tokens, 120);
    }

    #[test]
    fn test_chat_message_constructors() {
        let m = ChatMessage::user("hello");
        assert_eq!(m.role, Role::User);
        let m = ChatMessage::assistant("hi");
        assert_eq!(m.role, Role::Assistant);
    }

    #[test]
    fn test_request_serializes_without_empty_system() {
        let req = ModelRequest {
            model: "claude-sonnet-4-5".into(),
            system: None,
            messages: vec![ChatMessage::user("x")],
            max_tokens: 100,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("system"));
    }
}
