//! Configuration parsing and validation for freegate.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::health::{DEFAULT_BLACKLIST, DEFAULT_SEED_PROVIDERS};
use crate::provider::AUTO;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: Option<UpstreamConfig>,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub attempt: AttemptConfig,
    #[serde(default)]
    pub health: HealthConfig,
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:5500")
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Query parameter carrying the prompt on `GET /`
    #[serde(default = "default_keyword")]
    pub keyword: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
}

fn default_listen() -> String {
    "127.0.0.1:5500".to_string()
}

fn default_keyword() -> String {
    "text".to_string()
}

fn default_max_concurrent() -> usize {
    64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            keyword: default_keyword(),
            max_concurrent_requests: default_max_concurrent(),
        }
    }
}

/// The g4f-compatible endpoint that serves Auto mode.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL, e.g. "http://127.0.0.1:1337/v1"
    pub url: String,
    pub api_key: Option<ApiKey>,
    /// Request SSE responses instead of a single JSON body
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub models: Vec<String>,
}

/// Per-request defaults, overridable by the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_true")]
    pub remove_sources: bool,
    #[serde(default)]
    pub enable_history: bool,
    #[serde(default)]
    pub enable_proxies: bool,
}

fn default_provider() -> String {
    AUTO.to_string()
}

fn default_model() -> String {
    "gpt-4".to_string()
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            system_prompt: None,
            remove_sources: true,
            enable_history: false,
            enable_proxies: false,
        }
    }
}

/// Cookie and proxy file locations.
#[derive(Debug, Clone, Deserialize)]
pub struct FilesConfig {
    #[serde(default = "default_cookies_file")]
    pub cookies_file: Option<PathBuf>,
    #[serde(default = "default_proxies_file")]
    pub proxies_file: Option<PathBuf>,
}

fn default_cookies_file() -> Option<PathBuf> {
    Some(PathBuf::from("./data/cookies.json"))
}

fn default_proxies_file() -> Option<PathBuf> {
    Some(PathBuf::from("./data/proxies.json"))
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            cookies_file: default_cookies_file(),
            proxies_file: default_proxies_file(),
        }
    }
}

/// Single-attempt policy.
#[derive(Debug, Clone, Deserialize)]
pub struct AttemptConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries of the same provider within one attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    1
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl AttemptConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for AttemptConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Health monitor seeding.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Providers excluded from automatic selection at startup
    #[serde(default = "default_blacklist")]
    pub blacklist: Vec<String>,
    /// Cold-start fallback for reliable candidates
    #[serde(default = "default_seed_providers")]
    pub seed_providers: Vec<String>,
}

fn default_blacklist() -> Vec<String> {
    DEFAULT_BLACKLIST.iter().map(|s| s.to_string()).collect()
}

fn default_seed_providers() -> Vec<String> {
    DEFAULT_SEED_PROVIDERS.iter().map(|s| s.to_string()).collect()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            blacklist: default_blacklist(),
            seed_providers: default_seed_providers(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "./freegate.db".to_string()
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
///
/// Only accessible via `.expose_secret()`, so every use is grep-auditable.
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// How an API key was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Literal string in config
    Literal,
    /// Contained ${VAR} references expanded from the environment
    EnvExpanded,
    /// Auto-discovered from the convention env var (holds var name)
    Convention(String),
    None,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Literal => write!(f, "config-literal"),
            KeySource::EnvExpanded => write!(f, "env-expanded"),
            KeySource::Convention(var) => write!(f, "convention ({})", var),
            KeySource::None => write!(f, "none"),
        }
    }
}

/// A named upstream provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Name as understood by the upstream (e.g., "DDGS", "PollinationsAI")
    pub name: String,
    /// Base URL; falls back to `[upstream].url`
    pub url: Option<String>,
    pub api_key: Option<ApiKey>,
    #[serde(default)]
    pub models: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to log requests to database
    #[serde(default = "default_true")]
    pub log_requests: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_requests: true,
        }
    }
}

impl Config {
    /// Parse configuration from a TOML string.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() && self.upstream.is_none() {
            tracing::warn!("No providers or upstream configured - every request will fail");
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "Provider with empty name".to_string(),
                ));
            }
            if provider.name == AUTO {
                return Err(ConfigError::Validation(format!(
                    "Provider name '{}' is reserved for the upstream's own selection",
                    AUTO
                )));
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate provider '{}'",
                    provider.name
                )));
            }
            match &provider.url {
                Some(url) if url.is_empty() => {
                    return Err(ConfigError::Validation(format!(
                        "Provider '{}' has empty URL",
                        provider.name
                    )));
                }
                None if self.upstream.is_none() => {
                    return Err(ConfigError::Validation(format!(
                        "Provider '{}' has no URL and no [upstream] is configured",
                        provider.name
                    )));
                }
                _ => {}
            }
        }

        if let Some(upstream) = &self.upstream {
            if upstream.url.is_empty() {
                return Err(ConfigError::Validation("Upstream has empty URL".to_string()));
            }
        }

        if self.attempt.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "attempt.timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.defaults.model.trim().is_empty() {
            return Err(ConfigError::Validation(
                "defaults.model must not be empty".to_string(),
            ));
        }

        if self.server.max_concurrent_requests == 0 {
            return Err(ConfigError::Validation(
                "server.max_concurrent_requests must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for '{provider}': {message}")]
    EnvVar {
        var: String,
        provider: String,
        message: String,
    },
}

/// Raw provider config; `api_key` may still contain `${VAR}` references.
#[derive(Deserialize)]
pub struct RawProviderConfig {
    name: String,
    url: Option<String>,
    api_key: Option<String>,
    #[serde(default)]
    models: Vec<String>,
}

/// Raw upstream config; `api_key` may still contain `${VAR}` references.
#[derive(Deserialize)]
pub struct RawUpstreamConfig {
    url: String,
    api_key: Option<String>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    models: Vec<String>,
}

/// Raw configuration deserialized directly from TOML.
#[derive(Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    server: ServerConfig,
    upstream: Option<RawUpstreamConfig>,
    #[serde(default)]
    defaults: DefaultsConfig,
    #[serde(default)]
    files: FilesConfig,
    #[serde(default)]
    attempt: AttemptConfig,
    #[serde(default)]
    health: HealthConfig,
    database: Option<DatabaseConfig>,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    providers: Vec<RawProviderConfig>,
}

/// Name under which the upstream's key source is reported.
pub const UPSTREAM_KEY_NAME: &str = "upstream";

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Supports multiple `${VAR}` in one string (e.g., `${SCHEME}://${HOST}/v1`).
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(input: &str, owner: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            provider: owner.to_string(),
            message: format!("Unclosed '${{' in config value: {}", input),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                provider: owner.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            provider: owner.to_string(),
            message: format!(
                "Environment variable '{}' is not set (referenced in '{}')",
                var_name, owner
            ),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

/// Derive the convention-based env var name for a key owner.
///
/// - "DDGS" -> "FREEGATE_DDGS_API_KEY"
/// - "my-provider" -> "FREEGATE_MY_PROVIDER_API_KEY"
/// - "upstream" -> "FREEGATE_UPSTREAM_API_KEY"
pub fn convention_env_var_name(owner: &str) -> String {
    let upper_snake = owner.to_uppercase().replace(['-', ' ', '.'], "_");
    format!("FREEGATE_{}_API_KEY", upper_snake)
}

/// Resolve one raw key: `${VAR}` expansion, literal, or convention lookup.
fn resolve_key<F>(
    owner: &str,
    raw_key: Option<&str>,
    lookup: &F,
) -> Result<(Option<ApiKey>, KeySource), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(match raw_key {
        Some(raw_key) if raw_key.contains("${") => {
            let expanded = expand_env_vars_with(raw_key, owner, lookup)?;
            (Some(ApiKey::from(expanded)), KeySource::EnvExpanded)
        }
        Some(raw_key) => (Some(ApiKey::from(raw_key)), KeySource::Literal),
        None => {
            let var_name = convention_env_var_name(owner);
            match lookup(&var_name) {
                Some(value) => (Some(ApiKey::from(value)), KeySource::Convention(var_name)),
                None => (None, KeySource::None),
            }
        }
    })
}

impl Config {
    /// Convert raw config to final config, resolving keys from the real environment.
    pub fn from_raw(raw: RawConfig) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        Self::from_raw_with(raw, |name| std::env::var(name).ok())
    }

    /// Convert raw config to final config with a custom variable lookup.
    ///
    /// Key sources are reported for the upstream (as `"upstream"`) and then
    /// each provider, in file order.
    pub fn from_raw_with<F>(
        raw: RawConfig,
        lookup: F,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut key_sources = Vec::with_capacity(raw.providers.len() + 1);

        let upstream = match raw.upstream {
            Some(ru) => {
                let (api_key, source) =
                    resolve_key(UPSTREAM_KEY_NAME, ru.api_key.as_deref(), &lookup)?;
                key_sources.push((UPSTREAM_KEY_NAME.to_string(), source));
                Some(UpstreamConfig {
                    url: ru.url,
                    api_key,
                    stream: ru.stream,
                    models: ru.models,
                })
            }
            None => None,
        };

        let mut providers = Vec::with_capacity(raw.providers.len());
        for rp in raw.providers {
            let (api_key, source) = resolve_key(&rp.name, rp.api_key.as_deref(), &lookup)?;
            key_sources.push((rp.name.clone(), source));
            providers.push(ProviderConfig {
                name: rp.name,
                url: rp.url,
                api_key,
                models: rp.models,
            });
        }

        let config = Config {
            server: raw.server,
            upstream,
            defaults: raw.defaults,
            files: raw.files,
            attempt: raw.attempt,
            health: raw.health,
            database: raw.database,
            logging: raw.logging,
            providers,
        };

        Ok((config, key_sources))
    }

    /// Apply `PORT`, `DEFAULT_MODEL` and `DEFAULT_PROVIDER` overrides.
    pub fn apply_env_overrides_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            let port: u16 = port.trim().parse().map_err(|_| {
                ConfigError::Validation(format!("PORT must be a port number, got '{}'", port))
            })?;
            let host = self
                .server
                .listen
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            self.server.listen = format!("{}:{}", host, port);
        }
        if let Some(model) = lookup("DEFAULT_MODEL") {
            self.defaults.model = model;
        }
        if let Some(provider) = lookup("DEFAULT_PROVIDER") {
            self.defaults.provider = provider;
        }
        Ok(())
    }

    /// Load configuration from a TOML file with environment handling.
    ///
    /// Reads the file, parses it as [`RawConfig`], resolves keys, applies
    /// environment overrides and validates. Returns the config and the key
    /// source of the upstream and every provider.
    pub fn from_file_with_env(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let content = read_file(path.as_ref())?;
        Self::parse_str_with(&content, |name| std::env::var(name).ok())
    }

    /// [`Config::from_file_with_env`] over a string and a custom lookup.
    pub fn parse_str_with<F>(
        content: &str,
        lookup: F,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw: RawConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
        let (mut config, key_sources) = Self::from_raw_with(raw, &lookup)?;
        config.apply_env_overrides_with(&lookup)?;
        config.validate()?;
        Ok((config, key_sources))
    }
}
