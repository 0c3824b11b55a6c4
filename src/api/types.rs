//! OpenAI-compatible request and response types.

use serde::{Deserialize, Serialize};

use crate::provider::ChatMessage;

/// Chat completion request (OpenAI-compatible, plus freegate extensions).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    /// Falls back to the configured default model.
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// History owner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// freegate extension: upstream provider to try first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// freegate extension: override citation stripping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_sources: Option<bool>,
}

impl ChatCompletionRequest {
    /// The prompt: the last user message.
    pub fn user_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
    }

    /// A leading system message, if any.
    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .first()
            .filter(|m| m.role == "system")
            .map(|m| m.content.as_str())
    }
}

/// Chat completion response (OpenAI-compatible).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<Choice>,
    /// freegate extension: which provider answered.
    pub freegate_provider: String,
}

/// A completion choice.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

/// Query for the plain-text `GET /` endpoint; the prompt itself sits under
/// the configured keyword and is read separately.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TextQuery {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub user: Option<String>,
    pub system_prompt: Option<String>,
    pub remove_sources: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsQuery {
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BlacklistRequest {
    #[serde(default)]
    pub reason: Option<String>,
}
