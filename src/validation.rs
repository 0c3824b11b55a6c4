//! Input validation for caller-supplied hints and messages.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::provider::{ProviderRegistry, AUTO};
use crate::sources::ProxyDescriptor;

/// Longest accepted provider or model name.
const MAX_NAME_LEN: usize = 100;

/// Longest accepted prompt, in characters.
pub const MAX_MESSAGE_LEN: usize = 10_000;

const PROXY_PROTOCOLS: &[&str] = &["http", "https", "socks4", "socks5"];

static CONTROL_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\x00-\x08\x0b\x0c\x0e-\x1f\x7f-\u{9f}]")
        .unwrap_or_else(|e| panic!("invalid control character regex: {e}"))
});

/// Accept `"Auto"` or any registered provider name.
pub fn validate_provider_hint(provider: &str, registry: &ProviderRegistry) -> Result<()> {
    if provider.trim().is_empty() {
        return Err(Error::Validation("Provider cannot be empty".to_string()));
    }
    if provider.len() > MAX_NAME_LEN {
        return Err(Error::Validation("Provider name too long".to_string()));
    }
    if provider == AUTO || registry.contains(provider) {
        return Ok(());
    }
    let mut available = vec![AUTO.to_string()];
    available.extend(registry.names().iter().cloned());
    Err(Error::Validation(format!(
        "Provider '{}' not available. Available: {}",
        provider,
        available.join(", ")
    )))
}

pub fn validate_model(model: &str) -> Result<()> {
    if model.trim().is_empty() {
        return Err(Error::Validation("Model cannot be empty".to_string()));
    }
    if model.len() > MAX_NAME_LEN {
        return Err(Error::Validation("Model name too long".to_string()));
    }
    Ok(())
}

/// Remove control characters, cap at `max_chars` characters and trim.
///
/// Newlines, tabs and carriage returns survive.
pub fn sanitize_input(value: &str, max_chars: usize) -> String {
    let cleaned = CONTROL_CHARS.replace_all(value, "");
    let capped: String = cleaned.chars().take(max_chars).collect();
    capped.trim().to_string()
}

/// Sanitize a prompt and reject it if nothing is left.
pub fn validate_message(message: &str) -> Result<String> {
    let sanitized = sanitize_input(message, MAX_MESSAGE_LEN);
    if sanitized.is_empty() {
        return Err(Error::Validation("Message cannot be empty".to_string()));
    }
    Ok(sanitized)
}

pub fn validate_proxy(proxy: &ProxyDescriptor) -> Result<()> {
    if !PROXY_PROTOCOLS.contains(&proxy.protocol.as_str()) {
        return Err(Error::Validation(format!(
            "Unsupported proxy protocol '{}'",
            proxy.protocol
        )));
    }
    if proxy.host.trim().is_empty() {
        return Err(Error::Validation("Proxy host cannot be empty".to_string()));
    }
    if proxy.port == 0 {
        return Err(Error::Validation(
            "Proxy port must be between 1 and 65535".to_string(),
        ));
    }
    Ok(())
}
