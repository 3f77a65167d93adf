//! External voice-runtime adapter.
//!
//! Outbound: replace an agent's active system prompt (the text produced by
//! the Designer's template) with bounded retry.  Inbound: validate and parse
//! post-call webhook payloads into [`TranscriptDelivery`]; routing to the
//! owning project happens in the pipeline.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PublishError {
    /// The runtime answered with a non-retryable rejection (4xx).
    #[error("voice runtime rejected prompt update for agent {agent_id}: {detail}")]
    Rejected { agent_id: String, detail: String },
    /// Transient failures exhausted the retry budget.
    #[error("voice runtime unreachable after {attempts} attempts: {detail}")]
    Unreachable { attempts: u32, detail: String },
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("webhook payload missing field: {0}")]
    MissingField(&'static str),
    #[error("webhook payload has an empty transcript")]
    EmptyTranscript,
}

/// A validated post-call delivery, ready for pipeline ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptDelivery {
    pub conversation_id: String,
    pub agent_id: String,
    /// Speaker-labelled turns flattened to `Speaker: text` lines.
    pub transcript: String,
    pub language: String,
}

#[derive(Debug, Clone)]
pub struct VoiceClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    max_retries: u32,
    backoff: Duration,
}

impl VoiceClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        max_retries: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            max_retries: max_retries.max(1),
            backoff,
        }
    }

    /// Replace the active system prompt for `agent_id`.
    ///
    /// Transient failures (network, 5xx) are retried with linear backoff up
    /// to the configured budget; a 4xx answer aborts immediately since
    /// resending the same body cannot succeed.
    pub async fn publish_script(
        &self,
        agent_id: &str,
        prompt_text: &str,
    ) -> Result<(), PublishError> {
        let endpoint = format!(
            "{}/agents/{agent_id}/prompt",
            self.base_url.trim_end_matches('/')
        );
        let payload = json!({ "prompt": prompt_text });

        let mut last_detail = String::new();
        for attempt in 1..=self.max_retries {
            let mut request = self.client.patch(&endpoint).json(&payload);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        info!(agent = %agent_id, attempt, "interviewer prompt published");
                        return Ok(());
                    }
                    let body = response.text().await.unwrap_or_default();
                    if status.is_client_error() {
                        return Err(PublishError::Rejected {
                            agent_id: agent_id.to_string(),
                            detail: format!("{status}: {body}"),
                        });
                    }
                    last_detail = format!("{status}: {body}");
                }
                Err(err) => last_detail = err.to_string(),
            }

            warn!(
                agent = %agent_id,
                attempt,
                detail = %last_detail,
                "prompt publication failed — backing off"
            );
            if attempt < self.max_retries {
                tokio::time::sleep(self.backoff * attempt).await;
            }
        }

        Err(PublishError::Unreachable {
            attempts: self.max_retries,
            detail: last_detail,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawTurn {
    #[serde(alias = "role")]
    speaker: String,
    #[serde(alias = "message")]
    text: String,
}

/// Validate and parse an incoming webhook payload.
///
/// The transcript is accepted either as pre-flattened text or as an array of
/// speaker-labelled turns; turns missing a speaker or text are skipped.
pub fn parse_transcript_payload(
    payload: &serde_json::Value,
) -> Result<TranscriptDelivery, PayloadError> {
    let conversation_id = payload["conversation_id"]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or(PayloadError::MissingField("conversation_id"))?
        .to_string();
    let agent_id = payload["agent_id"]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or(PayloadError::MissingField("agent_id"))?
        .to_string();
    let language = payload["language"]
        .as_str()
        .filter(|s| !s.is_empty())
        .unwrap_or("en")
        .to_string();

    let transcript = match &payload["transcript"] {
        serde_json::Value::String(text) => text.trim().to_string(),
        serde_json::Value::Array(turns) => {
            let mut lines = Vec::new();
            for turn in turns {
                match serde_json::from_value::<RawTurn>(turn.clone()) {
                    Ok(raw) if !raw.text.trim().is_empty() => {
                        lines.push(format!("{}: {}", raw.speaker, raw.text.trim()));
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "skipping undecodable transcript turn"),
                }
            }
            lines.join("\n")
        }
        _ => return Err(PayloadError::MissingField("transcript")),
    };

    if transcript.is_empty() {
        return Err(PayloadError::EmptyTranscript);
    }

    Ok(TranscriptDelivery {
        conversation_id,
        agent_id,
        transcript,
        language,
    })
}
