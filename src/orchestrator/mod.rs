//! Request-level policy engine.
//!
//! [`Orchestrator::generate_response`] validates the caller's hints, builds
//! the conversation, gathers cookie and proxy material, walks the failover
//! chain and post-processes the winning answer.

mod attempt;
mod fallback;

use std::path::PathBuf;
use std::sync::Arc;

pub use attempt::{run_attempt, AttemptPolicy};
pub use fallback::{
    format_attempts_header, run_fallback, Answer, AttemptRecord, AttemptTarget, FallbackOutcome,
    FallbackStage, MAX_HEALTHY_ATTEMPTS, MAX_RELIABLE_ATTEMPTS,
};

use crate::config::{Config, DefaultsConfig, FilesConfig};
use crate::error::{Error, Result};
use crate::health::{ProviderMonitor, StatusSummary};
use crate::normalize::strip_citations;
use crate::provider::{ChatMessage, InvokeRequest, ProviderError, ProviderRegistry, AUTO};
use crate::sources::{choose_proxy, load_cookies, load_proxies};
use crate::storage::HistoryStore;
use crate::validation::{validate_message, validate_model, validate_provider_hint};

/// Models offered for Auto when the upstream advertises none.
pub const GENERIC_MODELS: &[&str] = &["gpt-4", "gpt-4o", "gpt-4o-mini"];

/// One generation request. Unset fields fall back to the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub message: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    /// History owner; history is only used when this is set.
    pub username: Option<String>,
    pub use_history: bool,
    pub strip_citations: Option<bool>,
    pub use_proxy: Option<bool>,
    /// Overrides the configured cookie file for this request.
    pub cookie_file: Option<PathBuf>,
}

impl GenerateRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// A successful generation.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    /// Provider that answered (`"Auto"` for Auto mode).
    pub provider: String,
    pub requested_provider: String,
    pub model: String,
    pub attempts: Vec<AttemptRecord>,
}

/// Post-process a raw answer. Text that normalizes to nothing is a
/// `no_response` failure, not a success.
fn normalize_answer(text: String, strip: bool) -> std::result::Result<String, ProviderError> {
    let text = if strip { strip_citations(&text) } else { text };
    if text.trim().is_empty() {
        return Err(ProviderError::NoResponse);
    }
    Ok(text)
}

pub struct Orchestrator {
    registry: Arc<ProviderRegistry>,
    monitor: Arc<ProviderMonitor>,
    history: Option<Arc<dyn HistoryStore>>,
    defaults: DefaultsConfig,
    files: FilesConfig,
    policy: AttemptPolicy,
}

impl Orchestrator {
    pub fn new(registry: Arc<ProviderRegistry>, monitor: Arc<ProviderMonitor>) -> Self {
        Self {
            registry,
            monitor,
            history: None,
            defaults: DefaultsConfig::default(),
            files: FilesConfig {
                cookies_file: None,
                proxies_file: None,
            },
            policy: AttemptPolicy::default(),
        }
    }

    /// Orchestrator configured from `config`, with a fresh monitor.
    pub fn from_config(config: &Config, registry: Arc<ProviderRegistry>) -> Self {
        let monitor = ProviderMonitor::new(
            config.health.blacklist.iter().cloned(),
            config.health.seed_providers.clone(),
        );
        Self::new(registry, Arc::new(monitor))
            .with_defaults(config.defaults.clone())
            .with_files(config.files.clone())
            .with_policy(AttemptPolicy::from(&config.attempt))
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_defaults(mut self, defaults: DefaultsConfig) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_files(mut self, files: FilesConfig) -> Self {
        self.files = files;
        self
    }

    pub fn with_policy(mut self, policy: AttemptPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn monitor(&self) -> &ProviderMonitor {
        &self.monitor
    }

    pub fn defaults(&self) -> &DefaultsConfig {
        &self.defaults
    }

    /// Read-only health report.
    pub fn status_summary(&self) -> StatusSummary {
        self.monitor.status_summary()
    }

    /// Models offered by `provider` (`"Auto"` included).
    pub fn available_models(&self, provider: &str) -> Result<Vec<String>> {
        if provider == AUTO {
            let advertised = self.registry.auto().map(|p| p.models()).unwrap_or_default();
            if advertised.is_empty() {
                return Ok(GENERIC_MODELS.iter().map(|m| m.to_string()).collect());
            }
            return Ok(advertised);
        }

        let handle = self
            .registry
            .get(provider)
            .ok_or_else(|| Error::UnknownProvider(provider.to_string()))?;
        let models = handle.models();
        if models.is_empty() {
            Ok(vec!["default".to_string()])
        } else {
            Ok(models)
        }
    }

    async fn build_messages(
        &self,
        message: &str,
        system_prompt: Option<&str>,
        history_user: Option<&str>,
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::new();

        if let Some(prompt) = system_prompt {
            messages.push(ChatMessage::system(prompt));
        }

        if let (Some(store), Some(username)) = (&self.history, history_user) {
            match store.load(username).await {
                Ok(previous) => {
                    messages.extend(previous.into_iter().filter(|m| m.role != "system"))
                }
                Err(e) => {
                    tracing::warn!(username = %username, error = %e, "Failed to load chat history")
                }
            }
        }

        messages.push(ChatMessage::user(message));
        messages
    }

    async fn pick_proxy(&self) -> Option<String> {
        let proxies = load_proxies(self.files.proxies_file.as_deref()).await;
        let proxy = choose_proxy(&proxies)?;
        tracing::debug!(proxy = %proxy.masked(), "Using proxy");
        Some(proxy.url())
    }

    /// Produce a final answer for `request`, failing over across providers.
    ///
    /// Returns [`Error::Validation`] for malformed input and
    /// [`Error::AllProvidersFailed`] once every stage is exhausted.
    pub async fn generate_response(&self, request: GenerateRequest) -> Result<Generation> {
        let message = validate_message(&request.message)?;

        let requested = request
            .provider
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.defaults.provider.clone());
        validate_provider_hint(&requested, &self.registry)?;

        let model = request
            .model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.defaults.model.clone());
        validate_model(&model)?;

        let system_prompt = request
            .system_prompt
            .or_else(|| self.defaults.system_prompt.clone())
            .filter(|p| !p.trim().is_empty());

        let history_user = request
            .username
            .as_deref()
            .filter(|_| {
                request.use_history && self.defaults.enable_history && self.history.is_some()
            });

        let mut messages = self
            .build_messages(&message, system_prompt.as_deref(), history_user)
            .await;

        let cookie_file = request.cookie_file.or_else(|| self.files.cookies_file.clone());
        let cookies = load_cookies(cookie_file.as_deref()).await;
        let proxy = if request.use_proxy.unwrap_or(self.defaults.enable_proxies) {
            self.pick_proxy().await
        } else {
            None
        };

        tracing::info!(
            provider = %requested,
            model = %model,
            history = history_user.is_some(),
            messages = messages.len(),
            proxied = proxy.is_some(),
            "Generating response"
        );

        let strip = request.strip_citations.unwrap_or(self.defaults.remove_sources);
        let outcome = run_fallback(&self.monitor, &self.registry, &requested, |target| {
            let invoke = InvokeRequest {
                model: model.clone(),
                messages: messages.clone(),
                cookies: cookies.clone(),
                proxy: proxy.clone(),
                provider: target.explicit_provider(),
            };
            let policy = self.policy.clone();
            async move {
                let text = run_attempt(target.provider.as_ref(), &invoke, &policy).await?;
                normalize_answer(text, strip)
            }
        })
        .await;

        let FallbackOutcome { answer, attempts } = outcome;
        let Some(answer) = answer else {
            let summary = self.monitor.status_summary();
            tracing::error!(
                requested = %requested,
                attempts = attempts.len(),
                summary = %serde_json::to_string(&summary).unwrap_or_default(),
                "All providers failed"
            );
            return Err(Error::AllProvidersFailed {
                attempts: attempts.len(),
                summary: Box::new(summary),
            });
        };

        let text = answer.text;

        if let (Some(store), Some(username)) = (&self.history, history_user) {
            messages.push(ChatMessage::assistant(text.clone()));
            if let Err(e) = store.save(username, &messages).await {
                tracing::warn!(username = %username, error = %e, "Failed to save chat history");
            }
        }

        tracing::info!(
            provider = %answer.provider,
            requested = %requested,
            attempts = attempts.len(),
            "Response generated"
        );

        Ok(Generation {
            text,
            provider: answer.provider,
            requested_provider: requested,
            model,
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::FailureCategory;
    use crate::provider::{Provider, ProviderOutput};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers with `reply`, remembering every request it saw.
    struct Recording {
        reply: Option<&'static str>,
        seen: Mutex<Vec<InvokeRequest>>,
    }

    impl Recording {
        fn new(reply: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Provider for Recording {
        async fn invoke(
            &self,
            request: InvokeRequest,
        ) -> std::result::Result<ProviderOutput, ProviderError> {
            self.seen.lock().unwrap().push(request);
            match self.reply {
                Some(text) => Ok(ProviderOutput::Text(text.to_string())),
                None => Err(ProviderError::Other("upstream exploded".into())),
            }
        }

        fn models(&self) -> Vec<String> {
            vec!["gpt-4o".into()]
        }
    }

    /// In-memory history for tests.
    #[derive(Default)]
    struct MemoryHistory(Mutex<std::collections::HashMap<String, Vec<ChatMessage>>>);

    #[async_trait]
    impl HistoryStore for MemoryHistory {
        async fn load(
            &self,
            username: &str,
        ) -> std::result::Result<Vec<ChatMessage>, sqlx::Error> {
            Ok(self.0.lock().unwrap().get(username).cloned().unwrap_or_default())
        }

        async fn save(
            &self,
            username: &str,
            messages: &[ChatMessage],
        ) -> std::result::Result<(), sqlx::Error> {
            self.0.lock().unwrap().insert(username.to_string(), messages.to_vec());
            Ok(())
        }
    }

    fn orchestrator(registry: ProviderRegistry) -> Orchestrator {
        let policy = AttemptPolicy {
            max_retries: 0,
            ..AttemptPolicy::default()
        };
        let monitor = ProviderMonitor::new(Vec::<String>::new(), Vec::new());
        Orchestrator::new(Arc::new(registry), Arc::new(monitor)).with_policy(policy)
    }

    #[tokio::test]
    async fn test_generate_strips_citations_by_default() {
        let mut registry = ProviderRegistry::new();
        registry
            .register("Bing", Recording::new(Some("Sources: a\n\n[^1^][1]The answer")))
            .unwrap();
        let orch = orchestrator(registry);

        let mut request = GenerateRequest::new("question?");
        request.provider = Some("Bing".into());
        let generation = orch.generate_response(request).await.unwrap();
        assert_eq!(generation.text, "The answer");
        assert_eq!(generation.provider, "Bing");
        assert_eq!(generation.model, "gpt-4");
    }

    #[tokio::test]
    async fn test_generate_without_stripping() {
        let mut registry = ProviderRegistry::new();
        registry.set_auto(Recording::new(Some("raw [^1^][1] text")));
        let orch = orchestrator(registry);

        let mut request = GenerateRequest::new("q");
        request.strip_citations = Some(false);
        let generation = orch.generate_response(request).await.unwrap();
        assert_eq!(generation.text, "raw [^1^][1] text");
        assert_eq!(generation.provider, AUTO);
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let orch = orchestrator(ProviderRegistry::new());

        let err = orch.generate_response(GenerateRequest::new("  ")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let mut request = GenerateRequest::new("hi");
        request.provider = Some("Nope".into());
        let err = orch.generate_response(request).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_all_failed_carries_summary() {
        let mut registry = ProviderRegistry::new();
        registry.register("A", Recording::new(None)).unwrap();
        registry.set_auto(Recording::new(None));
        let orch = orchestrator(registry);

        let mut request = GenerateRequest::new("hi");
        request.provider = Some("A".into());
        match orch.generate_response(request).await.unwrap_err() {
            Error::AllProvidersFailed { attempts, summary } => {
                assert_eq!(attempts, 2);
                let a = summary.find("A").unwrap();
                assert!(a.error_types.contains(&FailureCategory::Exception));
                assert!(summary.find(AUTO).is_some());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_messages_and_history() {
        let provider = Recording::new(Some("second answer"));
        let mut registry = ProviderRegistry::new();
        registry.set_auto(provider.clone());

        let history = Arc::new(MemoryHistory::default());
        history
            .save(
                "alice",
                &[
                    ChatMessage::system("old prompt"),
                    ChatMessage::user("first"),
                    ChatMessage::assistant("first answer"),
                ],
            )
            .await
            .unwrap();

        let defaults = DefaultsConfig {
            enable_history: true,
            system_prompt: Some("Be brief.".into()),
            ..DefaultsConfig::default()
        };
        let orch = orchestrator(registry)
            .with_defaults(defaults)
            .with_history(history.clone());

        let mut request = GenerateRequest::new("second");
        request.username = Some("alice".into());
        request.use_history = true;
        orch.generate_response(request).await.unwrap();

        let seen = provider.seen.lock().unwrap();
        let sent: Vec<(&str, &str)> = seen[0]
            .messages
            .iter()
            .map(|m| (m.role.as_str(), m.content.as_str()))
            .collect();
        assert_eq!(
            sent,
            vec![
                ("system", "Be brief."),
                ("user", "first"),
                ("assistant", "first answer"),
                ("user", "second"),
            ]
        );
        assert_eq!(seen[0].cookies.get("dummy").map(String::as_str), Some("value"));
        assert!(seen[0].provider.is_none());

        let saved = history.load("alice").await.unwrap();
        assert_eq!(saved.len(), 5);
        assert_eq!(saved[4], ChatMessage::assistant("second answer"));
    }

    #[tokio::test]
    async fn test_history_ignored_when_disabled() {
        let provider = Recording::new(Some("ok"));
        let mut registry = ProviderRegistry::new();
        registry.set_auto(provider.clone());
        let history = Arc::new(MemoryHistory::default());
        let orch = orchestrator(registry).with_history(history.clone());

        let mut request = GenerateRequest::new("hi");
        request.username = Some("bob".into());
        request.use_history = true;
        orch.generate_response(request).await.unwrap();

        assert!(history.load("bob").await.unwrap().is_empty());
        assert_eq!(provider.seen.lock().unwrap()[0].messages.len(), 1);
    }

    #[tokio::test]
    async fn test_citation_only_answer_is_no_response() {
        let mut registry = ProviderRegistry::new();
        registry
            .register("Bing", Recording::new(Some("[^1^][1] source a\n\n[^2^][2]")))
            .unwrap();
        let orch = orchestrator(registry);

        let mut request = GenerateRequest::new("question?");
        request.provider = Some("Bing".into());
        let err = orch.generate_response(request).await.unwrap_err();
        assert!(matches!(err, Error::AllProvidersFailed { attempts: 1, .. }), "{err}");

        let health = orch.monitor().health("Bing").unwrap();
        assert_eq!(health.success_count, 0);
        assert_eq!(health.failure_count, 1);
        assert!(health.error_types.contains(&FailureCategory::NoResponse));
    }

    #[tokio::test]
    async fn test_citation_only_answer_kept_without_stripping() {
        let mut registry = ProviderRegistry::new();
        registry.set_auto(Recording::new(Some("[^1^][1] source a")));
        let orch = orchestrator(registry);

        let mut request = GenerateRequest::new("q");
        request.strip_citations = Some(false);
        let generation = orch.generate_response(request).await.unwrap();
        assert_eq!(generation.text, "[^1^][1] source a");
        assert_eq!(orch.monitor().health(AUTO).unwrap().success_count, 1);
    }

    #[tokio::test]
    async fn test_request_cookie_file_overrides_config() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"session": "per-request"}"#).unwrap();

        let provider = Recording::new(Some("ok"));
        let mut registry = ProviderRegistry::new();
        registry.set_auto(provider.clone());
        let orch = orchestrator(registry);

        let mut request = GenerateRequest::new("hi");
        request.cookie_file = Some(file.path().to_path_buf());
        orch.generate_response(request).await.unwrap();

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen[0].cookies.get("session").map(String::as_str), Some("per-request"));
        assert!(seen[0].cookies.get("dummy").is_none());
    }

    #[test]
    fn test_available_models() {
        let mut registry = ProviderRegistry::new();
        registry.register("Known", Recording::new(Some("x"))).unwrap();
        let orch = orchestrator(registry);

        assert_eq!(orch.available_models(AUTO).unwrap(), vec!["gpt-4", "gpt-4o", "gpt-4o-mini"]);
        assert_eq!(orch.available_models("Known").unwrap(), vec!["gpt-4o"]);
        assert!(matches!(
            orch.available_models("Missing"),
            Err(Error::UnknownProvider(_))
        ));
    }
}
