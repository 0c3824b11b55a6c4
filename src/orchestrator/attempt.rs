//! One attempt against one provider: bounded time, fail-fast retry.

use std::time::Duration;

use crate::config::AttemptConfig;
use crate::normalize::collect_text;
use crate::provider::{InvokeRequest, Provider, ProviderError};

/// Per-attempt limits.
#[derive(Debug, Clone)]
pub struct AttemptPolicy {
    /// Deadline for each try, covering the call and stream collection.
    pub timeout: Duration,
    /// Extra tries against the same provider after the first.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for AttemptPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_retries: 1,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl From<&AttemptConfig> for AttemptPolicy {
    fn from(config: &AttemptConfig) -> Self {
        Self {
            timeout: config.timeout(),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
        }
    }
}

async fn try_once(
    provider: &dyn Provider,
    request: InvokeRequest,
    timeout: Duration,
) -> Result<String, ProviderError> {
    let call = async {
        let output = provider.invoke(request).await?;
        collect_text(output).await
    };

    let text = match tokio::time::timeout(timeout, call).await {
        Ok(result) => result?,
        Err(_) => return Err(ProviderError::Timeout(timeout)),
    };

    if text.trim().is_empty() {
        return Err(ProviderError::NoResponse);
    }
    Ok(text)
}

/// Run one attempt: at most `1 + max_retries` tries, each under `timeout`.
///
/// Blank text counts as [`ProviderError::NoResponse`]. Unauthorized and
/// browser-required failures are never retried.
pub async fn run_attempt(
    provider: &dyn Provider,
    request: &InvokeRequest,
    policy: &AttemptPolicy,
) -> Result<String, ProviderError> {
    let mut retries = 0;
    loop {
        let err = match try_once(provider, request.clone(), policy.timeout).await {
            Ok(text) => return Ok(text),
            Err(err) => err,
        };

        let category = err.category();
        if retries >= policy.max_retries || !category.is_retryable() {
            return Err(err);
        }

        retries += 1;
        tracing::debug!(
            category = %category,
            error = %err,
            retry = retries,
            "Attempt failed, retrying same provider"
        );
        tokio::time::sleep(policy.retry_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::FailureCategory;
    use crate::provider::{ChatMessage, ProviderOutput};
    use crate::sources::placeholder_cookies;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    enum Step {
        Text(&'static str),
        Fail(fn() -> ProviderError),
        Hang,
    }

    /// Replays scripted outcomes, one per call.
    struct Scripted {
        steps: Mutex<Vec<Step>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Provider for Scripted {
        async fn invoke(&self, _: InvokeRequest) -> Result<ProviderOutput, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.steps.lock().unwrap().remove(0);
            match step {
                Step::Text(text) => Ok(ProviderOutput::Text(text.to_string())),
                Step::Fail(make) => Err(make()),
                Step::Hang => std::future::pending().await,
            }
        }
    }

    fn unauthorized() -> ProviderError {
        ProviderError::Unauthorized("401".into())
    }

    fn reset() -> ProviderError {
        ProviderError::Network("reset".into())
    }

    fn request() -> InvokeRequest {
        InvokeRequest {
            model: "gpt-4".into(),
            messages: vec![ChatMessage::user("hi")],
            cookies: placeholder_cookies(),
            proxy: None,
            provider: None,
        }
    }

    fn policy() -> AttemptPolicy {
        AttemptPolicy {
            timeout: Duration::from_secs(60),
            max_retries: 1,
            retry_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_try() {
        let provider = Scripted::new(vec![Step::Text("answer")]);
        let text = run_attempt(&provider, &request(), &policy()).await.unwrap();
        assert_eq!(text, "answer");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_text_is_no_response() {
        let provider = Scripted::new(vec![Step::Text("  \n"), Step::Text("")]);
        let err = run_attempt(&provider, &request(), &policy()).await.unwrap_err();
        assert_eq!(err.category(), FailureCategory::NoResponse);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_success_on_retry() {
        let provider = Scripted::new(vec![Step::Hang, Step::Text("late but fine")]);
        let text = run_attempt(&provider, &request(), &policy()).await.unwrap();
        assert_eq!(text, "late but fine");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_exhausts_retries() {
        let provider = Scripted::new(vec![Step::Hang, Step::Hang]);
        let err = run_attempt(&provider, &request(), &policy()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(d) if d == Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_not_retried() {
        let provider = Scripted::new(vec![Step::Fail(unauthorized), Step::Text("unreachable")]);
        let err = run_attempt(&provider, &request(), &policy()).await.unwrap_err();
        assert_eq!(err.category(), FailureCategory::Unauthorized);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retries_configured() {
        let provider = Scripted::new(vec![Step::Fail(reset)]);
        let policy = AttemptPolicy {
            max_retries: 0,
            ..policy()
        };
        let err = run_attempt(&provider, &request(), &policy).await.unwrap_err();
        assert_eq!(err.category(), FailureCategory::Network);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }
}
