//! Name → provider lookup.

use std::collections::HashMap;
use std::sync::Arc;

use super::openai::OpenAiCompatProvider;
use super::{Provider, AUTO};
use crate::config::Config;
use crate::error::{Error, Result};

/// Static mapping from provider name to capability, plus the optional Auto capability.
///
/// Names are enumerated in registration order; candidate lists inherit that order.
#[derive(Default)]
pub struct ProviderRegistry {
    order: Vec<String>,
    providers: HashMap<String, Arc<dyn Provider>>,
    auto: Option<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` under `name`. Re-registering a name replaces the handle
    /// but keeps its original position.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) -> Result<()> {
        let name = name.into();
        if name == AUTO {
            return Err(Error::Internal(format!(
                "'{}' is reserved; use ProviderRegistry::set_auto",
                AUTO
            )));
        }
        if self.providers.insert(name.clone(), provider).is_none() {
            self.order.push(name);
        }
        Ok(())
    }

    /// Install the capability used for Auto mode.
    pub fn set_auto(&mut self, provider: Arc<dyn Provider>) {
        self.auto = Some(provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn auto(&self) -> Option<Arc<dyn Provider>> {
        self.auto.clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Registered names (never including `"Auto"`), in registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Build the registry described by `config`.
    ///
    /// `[upstream]` becomes the Auto capability and the default base URL for
    /// every `[[providers]]` entry that has no URL of its own.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = OpenAiCompatProvider::default_client(config.attempt.timeout())
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;

        let mut registry = Self::new();

        if let Some(upstream) = &config.upstream {
            let auto = OpenAiCompatProvider::new(client.clone(), upstream.url.clone(), None)
                .with_api_key(upstream.api_key.clone())
                .with_models(upstream.models.clone())
                .with_stream(upstream.stream);
            registry.set_auto(Arc::new(auto));
        }

        for provider in &config.providers {
            let url = provider
                .url
                .clone()
                .or_else(|| config.upstream.as_ref().map(|u| u.url.clone()))
                .ok_or_else(|| {
                    Error::Internal(format!("provider '{}' has no URL", provider.name))
                })?;
            let api_key = provider
                .api_key
                .clone()
                .or_else(|| config.upstream.as_ref().and_then(|u| u.api_key.clone()));
            let stream = config.upstream.as_ref().map(|u| u.stream).unwrap_or(false);

            let handle = OpenAiCompatProvider::new(client.clone(), url, Some(provider.name.clone()))
                .with_api_key(api_key)
                .with_models(provider.models.clone())
                .with_stream(stream);
            registry.register(provider.name.clone(), Arc::new(handle))?;
        }

        tracing::info!(
            providers = registry.len(),
            auto = registry.auto.is_some(),
            "provider registry ready"
        );

        Ok(registry)
    }
}
