//! The ordered failover chain for one request.
//!
//! Stages run strictly in sequence, one provider at a time:
//! 1. the requested provider (skipped when it is blacklisted or `"Auto"`)
//! 2. Auto mode, if an Auto capability is registered
//! 3. up to [`MAX_RELIABLE_ATTEMPTS`] reliable candidates
//! 4. up to [`MAX_HEALTHY_ATTEMPTS`] healthy candidates
//!
//! A provider is never tried twice in one request. Every outcome is recorded
//! in the [`ProviderMonitor`] before the next stage starts.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;

use crate::health::{FailureCategory, ProviderMonitor};
use crate::provider::{Provider, ProviderError, ProviderRegistry, AUTO};

/// Reliable candidates tried per request.
pub const MAX_RELIABLE_ATTEMPTS: usize = 3;

/// Healthy candidates tried per request, after the reliable ones.
pub const MAX_HEALTHY_ATTEMPTS: usize = 5;

/// Which part of the chain produced an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackStage {
    Requested,
    Auto,
    Reliable,
    Healthy,
}

impl fmt::Display for FallbackStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FallbackStage::Requested => "requested",
            FallbackStage::Auto => "auto",
            FallbackStage::Reliable => "reliable",
            FallbackStage::Healthy => "healthy",
        })
    }
}

/// One provider call within the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub provider: String,
    pub stage: FallbackStage,
    /// `None` when the attempt succeeded.
    pub failure: Option<FailureCategory>,
}

/// What the `send` callback is asked to call.
pub struct AttemptTarget {
    /// Name recorded in the monitor; `"Auto"` for the Auto stage.
    pub name: String,
    pub stage: FallbackStage,
    pub provider: Arc<dyn Provider>,
}

impl AttemptTarget {
    /// Provider to name explicitly in the upstream call; `None` for Auto.
    pub fn explicit_provider(&self) -> Option<String> {
        (self.stage != FallbackStage::Auto).then(|| self.name.clone())
    }
}

/// Winning provider and its answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub provider: String,
    pub text: String,
}

/// Result of walking the chain.
#[derive(Debug)]
pub struct FallbackOutcome {
    /// `None` when every attempt failed.
    pub answer: Option<Answer>,
    /// Every attempt in the order it was made.
    pub attempts: Vec<AttemptRecord>,
}

impl FallbackOutcome {
    pub fn failed_attempts(&self) -> usize {
        self.attempts.iter().filter(|a| a.failure.is_some()).count()
    }
}

/// Format failed attempts for the `x-freegate-attempts` header.
///
/// Format: `"DDGS/timeout, Auto/no_response"`, in attempt order.
/// Returns `None` when nothing failed.
pub fn format_attempts_header(attempts: &[AttemptRecord]) -> Option<String> {
    let failed: Vec<String> = attempts
        .iter()
        .filter_map(|a| a.failure.map(|cat| format!("{}/{}", a.provider, cat)))
        .collect();
    if failed.is_empty() {
        None
    } else {
        Some(failed.join(", "))
    }
}

struct Chain<'a, F> {
    monitor: &'a ProviderMonitor,
    send: F,
    attempts: Vec<AttemptRecord>,
    tried: HashSet<String>,
}

impl<F, Fut> Chain<'_, F>
where
    F: Fn(AttemptTarget) -> Fut,
    Fut: Future<Output = Result<String, ProviderError>>,
{
    async fn attempt(
        &mut self,
        name: &str,
        stage: FallbackStage,
        provider: Arc<dyn Provider>,
    ) -> Option<Answer> {
        self.tried.insert(name.to_string());

        let target = AttemptTarget {
            name: name.to_string(),
            stage,
            provider,
        };

        match (self.send)(target).await {
            Ok(text) => {
                self.monitor.record_success(name);
                self.attempts.push(AttemptRecord {
                    provider: name.to_string(),
                    stage,
                    failure: None,
                });
                tracing::info!(provider = %name, stage = %stage, "Provider answered");
                Some(Answer {
                    provider: name.to_string(),
                    text,
                })
            }
            Err(err) => {
                let category = err.category();
                self.monitor.record_failure(name, category);
                self.attempts.push(AttemptRecord {
                    provider: name.to_string(),
                    stage,
                    failure: Some(category),
                });
                tracing::warn!(
                    provider = %name,
                    stage = %stage,
                    category = %category,
                    error = %err,
                    "Provider attempt failed"
                );
                None
            }
        }
    }

    fn finish(self, answer: Option<Answer>) -> FallbackOutcome {
        FallbackOutcome {
            answer,
            attempts: self.attempts,
        }
    }
}

/// Walk the failover chain for `requested`, calling `send` once per attempt.
///
/// `send` performs a single attempt (see [`super::run_attempt`]) and owns
/// timeouts and blank-text detection; this function owns ordering, caps and
/// health bookkeeping.
pub async fn run_fallback<F, Fut>(
    monitor: &ProviderMonitor,
    registry: &ProviderRegistry,
    requested: &str,
    send: F,
) -> FallbackOutcome
where
    F: Fn(AttemptTarget) -> Fut,
    Fut: Future<Output = Result<String, ProviderError>>,
{
    let mut chain = Chain {
        monitor,
        send,
        attempts: Vec::new(),
        tried: HashSet::new(),
    };

    let effective = if requested != AUTO && monitor.is_blacklisted(requested) {
        tracing::info!(provider = %requested, "Requested provider is blacklisted, using Auto");
        AUTO
    } else {
        requested
    };

    if effective != AUTO {
        match registry.get(effective) {
            Some(provider) => {
                if let Some(answer) = chain
                    .attempt(effective, FallbackStage::Requested, provider)
                    .await
                {
                    return chain.finish(Some(answer));
                }
            }
            None => tracing::debug!(provider = %effective, "Requested provider not registered"),
        }
    }

    match registry.auto() {
        Some(auto) => {
            if let Some(answer) = chain.attempt(AUTO, FallbackStage::Auto, auto).await {
                return chain.finish(Some(answer));
            }
        }
        None => tracing::debug!("No Auto capability registered, skipping Auto stage"),
    }

    let reliable: Vec<String> = monitor
        .reliable_candidates(registry.names())
        .into_iter()
        .filter(|name| !chain.tried.contains(name))
        .take(MAX_RELIABLE_ATTEMPTS)
        .collect();
    tracing::debug!(candidates = ?reliable, "Trying reliable candidates");

    for name in reliable {
        let Some(provider) = registry.get(&name) else {
            continue;
        };
        if let Some(answer) = chain.attempt(&name, FallbackStage::Reliable, provider).await {
            return chain.finish(Some(answer));
        }
    }

    let healthy: Vec<String> = monitor
        .healthy_candidates(registry.names())
        .into_iter()
        .filter(|name| !chain.tried.contains(name))
        .take(MAX_HEALTHY_ATTEMPTS)
        .collect();
    tracing::debug!(candidates = ?healthy, "Trying healthy candidates");

    for name in healthy {
        let Some(provider) = registry.get(&name) else {
            continue;
        };
        if let Some(answer) = chain.attempt(&name, FallbackStage::Healthy, provider).await {
            return chain.finish(Some(answer));
        }
    }

    chain.finish(None)
}
