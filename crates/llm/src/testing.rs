//! Scripted [`ChatBackend`] for exercising LLM-backed paths without a
//! provider.  Used by this crate's tests and by downstream engine tests.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::{ChatBackend, ChatMessage, LlmError};

/// One recorded backend call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model: String,
    pub temperature: f64,
    pub message_count: usize,
    /// Content of the final user message, for prompt assertions.
    pub last_user_content: String,
}

/// Replays a fixed sequence of replies and records every call it receives.
/// Once the script is exhausted, further calls fail as unavailable.
pub struct ScriptedBackend {
    replies: Mutex<Vec<Result<String, LlmError>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<Result<String, LlmError>>) -> Self {
        let mut replies = replies;
        replies.reverse();
        Self {
            replies: Mutex::new(replies),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Convenience constructor for the common all-Ok case.
    pub fn with_json_replies(replies: Vec<serde_json::Value>) -> Self {
        Self::new(replies.into_iter().map(|v| Ok(v.to_string())).collect())
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f64,
        _max_tokens: u32,
    ) -> Result<String, LlmError> {
        let last_user_content = messages
            .iter()
            .rev()
            .find(|m| m.role == crate::ChatRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.calls.lock().expect("calls lock").push(RecordedCall {
            model: model.to_string(),
            temperature,
            message_count: messages.len(),
            last_user_content,
        });

        self.replies
            .lock()
            .expect("replies lock")
            .pop()
            .unwrap_or_else(|| Err(LlmError::Unavailable("scripted replies exhausted".to_string())))
    }
}
