//! Upstream provider capability contract and registry.
//!
//! Providers are opaque: the gateway only knows how to hand one an
//! [`InvokeRequest`] and get back text, a fragment stream, or an error.

pub mod openai;
mod registry;
pub mod sse;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::health::FailureCategory;
use crate::sources::Cookies;

pub use registry::ProviderRegistry;

/// Reserved meta-provider name: let the upstream library pick.
pub const AUTO: &str = "Auto";

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Everything a provider needs for one call.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub cookies: Cookies,
    /// Outbound proxy URL, credentials included.
    pub proxy: Option<String>,
    /// Explicit upstream provider; `None` means Auto.
    pub provider: Option<String>,
}

/// Lazy, finite, non-restartable sequence of text fragments.
pub type FragmentStream = BoxStream<'static, Result<String, ProviderError>>;

/// Raw provider output before normalization.
pub enum ProviderOutput {
    Text(String),
    Stream(FragmentStream),
}

impl std::fmt::Debug for ProviderOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderOutput::Text(text) => f.debug_tuple("Text").field(text).finish(),
            ProviderOutput::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// A chat completion backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Issue one chat completion call.
    async fn invoke(&self, request: InvokeRequest) -> Result<ProviderOutput, ProviderError>;

    /// Models this provider advertises, if known.
    fn models(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Why a single provider call failed.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("provider requires a browser session: {0}")]
    BrowserRequired(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("upstream returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("provider returned an empty response")]
    NoResponse,

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Failure category for health bookkeeping.
    pub fn category(&self) -> FailureCategory {
        match self {
            ProviderError::Unauthorized(_) => FailureCategory::Unauthorized,
            ProviderError::BrowserRequired(_) => FailureCategory::BrowserRequired,
            ProviderError::Timeout(_) => FailureCategory::Timeout,
            ProviderError::Network(_) => FailureCategory::Network,
            ProviderError::NoResponse => FailureCategory::NoResponse,
            ProviderError::Api { status: 401 | 403, .. } => FailureCategory::Unauthorized,
            ProviderError::Api { body, .. } => classify_message(body),
            ProviderError::Other(message) => classify_message(message),
        }
    }
}

/// Best-effort category for a free-form upstream error message.
pub fn classify_message(message: &str) -> FailureCategory {
    let lower = message.to_lowercase();
    if lower.contains("401") || lower.contains("403") || lower.contains("unauthorized") {
        FailureCategory::Unauthorized
    } else if lower.contains("chrome") || lower.contains("browser") {
        FailureCategory::BrowserRequired
    } else if lower.contains("timeout") || lower.contains("timed out") || lower.contains("too slow")
    {
        FailureCategory::Timeout
    } else {
        FailureCategory::Exception
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(Duration::ZERO)
        } else if err.is_connect() || err.is_request() || err.is_body() {
            ProviderError::Network(err.to_string())
        } else if err.is_decode() {
            ProviderError::Other(format!("failed to decode upstream response: {}", err))
        } else {
            ProviderError::Other(err.to_string())
        }
    }
}
