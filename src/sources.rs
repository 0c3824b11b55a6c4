//! Cookie and proxy material for outbound provider calls.
//!
//! Both come from JSON files on disk. A missing or empty cookie file yields a
//! placeholder map, because some providers reject requests with no cookies
//! at all. A missing proxy file just means no proxy.

use std::collections::BTreeMap;
use std::path::Path;

use rand::seq::SliceRandom;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};

use crate::validation::validate_proxy;

/// Cookie name → value.
pub type Cookies = BTreeMap<String, String>;

/// Non-empty stand-in used when no real cookies are available.
pub fn placeholder_cookies() -> Cookies {
    BTreeMap::from([("dummy".to_string(), "value".to_string())])
}

/// Accepted cookie file layouts: a flat object, or a browser-export list.
#[derive(Deserialize)]
#[serde(untagged)]
enum CookieFile {
    Map(BTreeMap<String, serde_json::Value>),
    List(Vec<CookieEntry>),
}

#[derive(Deserialize)]
struct CookieEntry {
    name: String,
    value: String,
}

fn json_to_cookie_value(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Load cookies from `path`, falling back to [`placeholder_cookies`].
pub async fn load_cookies(path: Option<&Path>) -> Cookies {
    let Some(path) = path else {
        return placeholder_cookies();
    };

    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) => {
            tracing::debug!(
                path = %path.display(),
                error = %e,
                "No cookie file, using placeholder"
            );
            return placeholder_cookies();
        }
    };

    let cookies: Cookies = match serde_json::from_str::<CookieFile>(&content) {
        Ok(CookieFile::Map(map)) => map
            .into_iter()
            .map(|(k, v)| (k, json_to_cookie_value(v)))
            .collect(),
        Ok(CookieFile::List(entries)) => entries.into_iter().map(|e| (e.name, e.value)).collect(),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Invalid cookie file, using placeholder"
            );
            return placeholder_cookies();
        }
    };

    if cookies.is_empty() {
        tracing::warn!(path = %path.display(), "No cookies found, using placeholder");
        return placeholder_cookies();
    }

    tracing::debug!(path = %path.display(), count = cookies.len(), "Loaded cookies");
    cookies
}

/// One outbound proxy.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyDescriptor {
    pub protocol: String,
    #[serde(default)]
    pub username: String,
    #[serde(default = "empty_secret", deserialize_with = "deserialize_secret")]
    pub password: SecretString,
    #[serde(alias = "ip")]
    pub host: String,
    #[serde(deserialize_with = "deserialize_port")]
    pub port: u16,
}

fn empty_secret() -> SecretString {
    SecretString::from(String::new())
}

fn deserialize_secret<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<SecretString, D::Error> {
    String::deserialize(deserializer).map(SecretString::from)
}

/// Ports show up both as numbers and as strings in proxy files.
fn deserialize_port<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u64),
        Text(String),
    }

    let raw = match Port::deserialize(deserializer)? {
        Port::Number(n) => n,
        Port::Text(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom(format!("invalid port '{}'", s)))?,
    };
    u16::try_from(raw).map_err(|_| serde::de::Error::custom(format!("port {} out of range", raw)))
}

impl ProxyDescriptor {
    /// Full proxy URL including credentials.
    pub fn url(&self) -> String {
        if self.username.is_empty() {
            format!("{}://{}:{}", self.protocol, self.host, self.port)
        } else {
            format!(
                "{}://{}:{}@{}:{}",
                self.protocol,
                self.username,
                self.password.expose_secret(),
                self.host,
                self.port
            )
        }
    }

    /// URL safe for logs.
    pub fn masked(&self) -> String {
        if self.username.is_empty() {
            format!("{}://{}:{}", self.protocol, self.host, self.port)
        } else {
            format!("{}://{}:***@{}:{}", self.protocol, self.username, self.host, self.port)
        }
    }
}

/// Load proxy descriptors from `path`. Invalid entries are skipped.
pub async fn load_proxies(path: Option<&Path>) -> Vec<ProxyDescriptor> {
    let Some(path) = path else {
        return Vec::new();
    };

    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "No proxies configured");
            return Vec::new();
        }
    };

    let raw: Vec<serde_json::Value> = match serde_json::from_str(&content) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Invalid proxy file");
            return Vec::new();
        }
    };

    raw.into_iter()
        .enumerate()
        .filter_map(|(index, value)| {
            let proxy = match serde_json::from_value::<ProxyDescriptor>(value) {
                Ok(proxy) => proxy,
                Err(e) => {
                    tracing::warn!(index, error = %e, "Skipping malformed proxy entry");
                    return None;
                }
            };
            match validate_proxy(&proxy) {
                Ok(()) => Some(proxy),
                Err(e) => {
                    tracing::warn!(
                        index,
                        proxy = %proxy.masked(),
                        error = %e,
                        "Skipping invalid proxy"
                    );
                    None
                }
            }
        })
        .collect()
}

/// Pick one proxy uniformly at random.
pub fn choose_proxy(proxies: &[ProxyDescriptor]) -> Option<&ProxyDescriptor> {
    proxies.choose(&mut rand::thread_rng())
}
