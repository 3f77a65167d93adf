//! The LLM oracle: a provider-agnostic chat call that guarantees a parsed
//! JSON object or a typed failure.
//!
//! The transport sits behind the [`ChatBackend`] trait so the engine can be
//! exercised with scripted replies; the production backend posts to any
//! OpenAI-compatible `/chat/completions` endpoint.  Calls are independent —
//! the oracle keeps no hidden state between them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

pub mod testing;

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    /// Transport-level failure (network, rate limit, timeout, non-success
    /// status).  Propagated to the caller, who owns the backoff policy.
    #[error("LLM provider unavailable: {0}")]
    Unavailable(String),
    /// The model kept returning text that does not decode as a JSON object,
    /// even after the in-call retry budget.
    #[error("LLM returned malformed JSON after {attempts} attempts: {detail}")]
    Format { attempts: u32, detail: String },
}

/// Transport seam between the oracle and its provider.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
    ) -> Result<String, LlmError>;
}

/// Production backend: OpenAI-compatible chat-completions over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| LlmError::Unavailable(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
        })
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
    ) -> Result<String, LlmError> {
        let endpoint = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": model,
            "messages": messages,
            "temperature": temperature,
            "max_tokens": max_tokens,
        });

        let mut request = self.client.post(endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| LlmError::Unavailable(err.to_string()))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| LlmError::Unavailable(err.to_string()))?;
        if !status.is_success() {
            return Err(LlmError::Unavailable(format!(
                "provider returned {status}: {body}"
            )));
        }

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| LlmError::Unavailable(format!("response missing content: {body}")))
    }
}

const STRICT_JSON_REMINDER: &str = "Your previous reply was not valid JSON. Respond with a \
     single JSON object and nothing else: no markdown fences, no prose before or after, \
     no trailing commas.";

/// Per-attempt temperature bump applied on format retries.
const RETRY_TEMPERATURE_STEP: f64 = 0.1;

/// JSON-returning chat call with a bounded in-call retry budget.
#[derive(Clone)]
pub struct Oracle {
    backend: Arc<dyn ChatBackend>,
    format_retries: u32,
}

impl Oracle {
    /// `format_retries` below 3 is raised to 3: the retry budget is a floor,
    /// not a knob for disabling retries.
    pub fn new(backend: Arc<dyn ChatBackend>, format_retries: u32) -> Self {
        Self {
            backend,
            format_retries: format_retries.max(3),
        }
    }

    /// One oracle call: returns a parsed JSON object or fails typed.
    ///
    /// Malformed replies are retried up to the budget, each attempt raising
    /// the temperature by a small step and appending a harder strict-JSON
    /// instruction.  Transport errors are propagated immediately — they do
    /// not consume format retries.
    pub async fn chat_json(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
    ) -> Result<serde_json::Value, LlmError> {
        let mut messages = messages.to_vec();
        let mut temperature = temperature;
        let mut last_detail = String::new();

        for attempt in 1..=self.format_retries {
            let raw = self
                .backend
                .complete(model, &messages, temperature, max_tokens)
                .await?;

            match extract_json_object(&raw) {
                Ok(value) => {
                    debug!(attempt, "oracle returned parseable JSON");
                    return Ok(value);
                }
                Err(detail) => {
                    warn!(attempt, %detail, "oracle reply was not a JSON object — retrying");
                    last_detail = detail;
                    temperature = (temperature + RETRY_TEMPERATURE_STEP).min(1.0);
                    messages.push(ChatMessage::system(STRICT_JSON_REMINDER));
                }
            }
        }

        Err(LlmError::Format {
            attempts: self.format_retries,
            detail: last_detail,
        })
    }
}

/// Pull the outermost JSON object out of a model reply, tolerating markdown
/// fences and stray prose around it.
fn extract_json_object(raw: &str) -> Result<serde_json::Value, String> {
    let trimmed = raw.trim();

    // Fast path: the whole reply is the object.
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if value.is_object() {
            return Ok(value);
        }
    }

    let start = trimmed.find('{').ok_or_else(|| "no '{' in reply".to_string())?;
    let end = trimmed.rfind('}').ok_or_else(|| "no '}' in reply".to_string())?;
    if end <= start {
        return Err("unbalanced braces in reply".to_string());
    }

    let candidate = &trimmed[start..=end];
    match serde_json::from_str::<serde_json::Value>(candidate) {
        Ok(value) if value.is_object() => Ok(value),
        Ok(_) => Err("reply parsed but is not a JSON object".to_string()),
        Err(err) => Err(err.to_string()),
    }
}
