//! Provider capability over the OpenAI chat-completions wire format.
//!
//! Targets g4f-style gateways: the upstream library picks the concrete
//! backend itself unless the body names one in its `provider` field.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use reqwest::Client;
use serde::Serialize;

use super::sse::fragment_stream;
use super::{ChatMessage, InvokeRequest, Provider, ProviderError, ProviderOutput};
use crate::config::ApiKey;
use crate::sources::Cookies;

/// Upper bound on how much of an error body ends up in a `ProviderError`.
const MAX_ERROR_BODY: usize = 512;

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<&'a str>,
}

/// An HTTP endpoint speaking `POST {base}/chat/completions`.
pub struct OpenAiCompatProvider {
    client: Client,
    base_url: String,
    /// Sent as the `provider` body field; `None` lets the upstream choose.
    provider_name: Option<String>,
    api_key: Option<ApiKey>,
    models: Vec<String>,
    stream: bool,
}

impl OpenAiCompatProvider {
    pub fn new(client: Client, base_url: impl Into<String>, provider_name: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            provider_name,
            api_key: None,
            models: Vec::new(),
            stream: false,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<ApiKey>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    /// Ask the upstream for an SSE stream instead of a single JSON body.
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Shared client with the gateway's connect and request timeouts.
    pub fn default_client(timeout: Duration) -> reqwest::Result<Client> {
        Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// The shared client, or a one-off client routed through `proxy`.
    fn client_for(&self, proxy: Option<&str>) -> Result<Client, ProviderError> {
        let Some(proxy) = proxy else {
            return Ok(self.client.clone());
        };
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| ProviderError::Network(format!("invalid proxy: {}", e)))?;
        Client::builder()
            .proxy(proxy)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Network(format!("failed to build proxied client: {}", e)))
    }
}

/// `Cookie` header value for a cookie map, `None` when empty.
fn cookie_header(cookies: &Cookies) -> Option<String> {
    if cookies.is_empty() {
        return None;
    }
    Some(
        cookies
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    async fn invoke(&self, request: InvokeRequest) -> Result<ProviderOutput, ProviderError> {
        let client = self.client_for(request.proxy.as_deref())?;

        // The per-call provider wins over the configured one only for Auto handles.
        let provider = self
            .provider_name
            .as_deref()
            .or(request.provider.as_deref());

        let body = CompletionBody {
            model: &request.model,
            messages: &request.messages,
            stream: self.stream,
            provider,
        };

        let mut upstream = client
            .post(self.endpoint())
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body);

        if let Some(cookie) = cookie_header(&request.cookies) {
            upstream = upstream.header(header::COOKIE, cookie);
        }
        if let Some(api_key) = &self.api_key {
            upstream = upstream.bearer_auth(api_key.expose_secret());
        }

        tracing::debug!(
            url = %self.endpoint(),
            provider = provider.unwrap_or(super::AUTO),
            model = %request.model,
            stream = self.stream,
            proxied = request.proxy.is_some(),
            "Calling upstream"
        );

        let response = upstream.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Unauthorized(format!(
                "{}: {}",
                status,
                truncate(body)
            )));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body: truncate(body),
            });
        }

        if self.stream {
            return Ok(ProviderOutput::Stream(fragment_stream(response.bytes_stream())));
        }

        let parsed: serde_json::Value = response.json().await?;
        if let Some(message) = parsed
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return Err(ProviderError::Other(message.to_string()));
        }

        let text = parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string();

        Ok(ProviderOutput::Text(text))
    }

    fn models(&self) -> Vec<String> {
        self.models.clone()
    }
}
