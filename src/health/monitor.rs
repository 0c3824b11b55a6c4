//! Per-provider health state machine and the process-wide monitor.
//!
//! Every provider gets a [`ProviderHealth`] record the first time a success or
//! failure is recorded for it. The record's [`HealthStatus`] is recomputed after
//! each update:
//! - **Unhealthy**: 5 or more consecutive failures
//! - **Degraded**: 3 or more consecutive failures, or success rate below 50%
//! - **Healthy**: success rate of at least 70%
//! - **Unknown**: anything else (including no history at all)
//!
//! [`ProviderMonitor`] owns all records plus the blacklist. Records live in a
//! [`DashMap`], so every update runs under that record's shard write lock and
//! concurrent requests never lose an increment.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};

use crate::provider::AUTO;

/// Consecutive failures that mark a provider unhealthy.
const UNHEALTHY_STREAK: u32 = 5;

/// Consecutive failures that mark a provider degraded.
const DEGRADED_STREAK: u32 = 3;

/// Success rate below which a provider is degraded.
const DEGRADED_RATE: f64 = 0.5;

/// Success rate at or above which a provider is healthy.
const HEALTHY_RATE: f64 = 0.7;

/// Success rate a provider must exceed to count as reliable.
const RELIABLE_RATE: f64 = 0.7;

/// A reliable provider must have succeeded within this many seconds.
const RELIABLE_WINDOW_SECS: i64 = 3600;

/// Providers excluded from automatic selection at startup.
pub const DEFAULT_BLACKLIST: &[&str] = &[
    "Chatai",     // rejects anonymous requests with 401
    "OpenaiChat", // needs an interactive browser session
];

/// Bootstrap list used by [`ProviderMonitor::reliable_candidates`] before any
/// provider has a track record.
pub const DEFAULT_SEED_PROVIDERS: &[&str] =
    &["DuckDuckGo", "Blackbox", "DeepInfra", "PerplexityLabs"];

/// Coarse health classification derived from a provider's statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    /// Lowercase string representation for JSON and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a single provider attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Credentials were rejected.
    Unauthorized,
    /// The provider only works from an interactive browser context.
    BrowserRequired,
    /// The attempt exceeded its deadline.
    Timeout,
    /// Connection-level failure.
    Network,
    /// Anything not covered by the other categories.
    Exception,
    /// The call returned, but with empty or blank text.
    NoResponse,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Unauthorized => "unauthorized",
            FailureCategory::BrowserRequired => "browser_required",
            FailureCategory::Timeout => "timeout",
            FailureCategory::Network => "network",
            FailureCategory::Exception => "exception",
            FailureCategory::NoResponse => "no_response",
        }
    }

    /// Whether another try against the same provider can help.
    ///
    /// Auth and browser failures will not change on an immediate retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FailureCategory::Unauthorized | FailureCategory::BrowserRequired
        )
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health record for one provider.
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub name: String,
    pub status: HealthStatus,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub error_types: BTreeSet<FailureCategory>,
}

impl ProviderHealth {
    /// Fresh record with no history.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unknown,
            success_count: 0,
            failure_count: 0,
            last_success_at: None,
            last_failure_at: None,
            consecutive_failures: 0,
            error_types: BTreeSet::new(),
        }
    }

    /// Lifetime success ratio, 0.0 when nothing has been recorded.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return 0.0;
        }
        self.success_count as f64 / total as f64
    }

    pub fn total_calls(&self) -> u64 {
        self.success_count + self.failure_count
    }

    /// Reliable right now.
    pub fn is_reliable(&self) -> bool {
        self.is_reliable_at(Utc::now())
    }

    /// Reliable at `now`: success rate above 70% and a success within the last hour.
    pub fn is_reliable_at(&self, now: DateTime<Utc>) -> bool {
        if self.success_rate() <= RELIABLE_RATE {
            return false;
        }
        match self.last_success_at {
            Some(at) => (now - at).num_seconds() < RELIABLE_WINDOW_SECS,
            None => false,
        }
    }

    pub(crate) fn apply_success(&mut self, now: DateTime<Utc>) {
        self.success_count += 1;
        self.last_success_at = Some(now);
        self.consecutive_failures = 0;
        self.update_status();
    }

    pub(crate) fn apply_failure(&mut self, category: FailureCategory, now: DateTime<Utc>) {
        self.failure_count += 1;
        self.last_failure_at = Some(now);
        self.consecutive_failures += 1;
        self.error_types.insert(category);
        self.update_status();
    }

    /// Recompute `status` from the current counters. First matching rule wins.
    fn update_status(&mut self) {
        let rate = self.success_rate();
        self.status = if self.consecutive_failures >= UNHEALTHY_STREAK {
            HealthStatus::Unhealthy
        } else if self.consecutive_failures >= DEGRADED_STREAK || rate < DEGRADED_RATE {
            HealthStatus::Degraded
        } else if rate >= HEALTHY_RATE {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unknown
        };
    }

    /// Whether the healthy-candidate filter lets this provider through.
    fn gets_a_chance(&self) -> bool {
        match self.status {
            HealthStatus::Healthy | HealthStatus::Unknown => true,
            HealthStatus::Degraded => self.consecutive_failures < DEGRADED_STREAK,
            HealthStatus::Unhealthy => false,
        }
    }
}

/// One provider's line in a [`StatusSummary`].
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    pub name: String,
    pub status: HealthStatus,
    pub success_rate: f64,
    pub total_calls: u64,
    pub consecutive_failures: u32,
    pub error_types: Vec<FailureCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl From<&ProviderHealth> for ProviderSummary {
    fn from(health: &ProviderHealth) -> Self {
        Self {
            name: health.name.clone(),
            status: health.status,
            success_rate: health.success_rate(),
            total_calls: health.total_calls(),
            consecutive_failures: health.consecutive_failures,
            error_types: health.error_types.iter().copied().collect(),
            last_success_at: health.last_success_at,
            last_failure_at: health.last_failure_at,
        }
    }
}

/// Snapshot of every tracked provider, grouped by status, plus the blacklist.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSummary {
    pub healthy: Vec<ProviderSummary>,
    pub degraded: Vec<ProviderSummary>,
    pub unhealthy: Vec<ProviderSummary>,
    pub unknown: Vec<ProviderSummary>,
    pub blacklisted: Vec<String>,
}

impl StatusSummary {
    /// Look up a provider in any bucket.
    pub fn find(&self, name: &str) -> Option<&ProviderSummary> {
        self.healthy
            .iter()
            .chain(&self.degraded)
            .chain(&self.unhealthy)
            .chain(&self.unknown)
            .find(|p| p.name == name)
    }

    pub fn tracked(&self) -> usize {
        self.healthy.len() + self.degraded.len() + self.unhealthy.len() + self.unknown.len()
    }
}

/// Process-wide provider health state.
///
/// Construct one per process (or one per test) and share it behind an `Arc`.
pub struct ProviderMonitor {
    records: DashMap<String, ProviderHealth>,
    blacklist: DashSet<String>,
    seed_providers: Vec<String>,
}

impl Default for ProviderMonitor {
    fn default() -> Self {
        Self::new(
            DEFAULT_BLACKLIST.iter().map(|s| s.to_string()),
            DEFAULT_SEED_PROVIDERS.iter().map(|s| s.to_string()).collect(),
        )
    }
}

impl ProviderMonitor {
    /// Create a monitor with a pre-seeded blacklist and a reliable-provider seed list.
    pub fn new(blacklist: impl IntoIterator<Item = String>, seed_providers: Vec<String>) -> Self {
        let set = DashSet::new();
        for name in blacklist {
            set.insert(name);
        }
        Self {
            records: DashMap::new(),
            blacklist: set,
            seed_providers,
        }
    }

    /// Record a successful attempt for `provider_name`.
    pub fn record_success(&self, provider_name: &str) {
        let mut health = self
            .records
            .entry(provider_name.to_string())
            .or_insert_with(|| ProviderHealth::new(provider_name));
        health.apply_success(Utc::now());

        tracing::debug!(
            provider = %provider_name,
            success_rate = health.success_rate(),
            status = %health.status,
            "success recorded"
        );
    }

    /// Record a failed attempt for `provider_name`.
    pub fn record_failure(&self, provider_name: &str, category: FailureCategory) {
        let mut health = self
            .records
            .entry(provider_name.to_string())
            .or_insert_with(|| ProviderHealth::new(provider_name));
        let previous = health.status;
        health.apply_failure(category, Utc::now());

        tracing::debug!(
            provider = %provider_name,
            category = %category,
            success_rate = health.success_rate(),
            consecutive_failures = health.consecutive_failures,
            "failure recorded"
        );

        if previous != HealthStatus::Unhealthy && health.status == HealthStatus::Unhealthy {
            tracing::warn!(
                provider = %provider_name,
                consecutive_failures = health.consecutive_failures,
                "provider marked UNHEALTHY"
            );
        }
    }

    pub fn is_blacklisted(&self, provider_name: &str) -> bool {
        self.blacklist.contains(provider_name)
    }

    /// Exclude `provider_name` from all automatic selection until restart.
    pub fn blacklist(&self, provider_name: &str, reason: &str) {
        self.blacklist.insert(provider_name.to_string());
        tracing::warn!(provider = %provider_name, reason = %reason, "provider blacklisted");
    }

    /// Cloned snapshot of one provider's record, if it has one.
    pub fn health(&self, provider_name: &str) -> Option<ProviderHealth> {
        self.records.get(provider_name).map(|r| r.value().clone())
    }

    /// Status for `provider_name`; untracked providers are `Unknown`.
    pub fn status(&self, provider_name: &str) -> HealthStatus {
        self.records
            .get(provider_name)
            .map(|r| r.status)
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Providers that are not known to be bad, in input order.
    ///
    /// Healthy and unknown providers are included, as are degraded ones with
    /// fewer than 3 consecutive failures. `"Auto"` and blacklisted names never are.
    pub fn healthy_candidates<I>(&self, provider_names: I) -> Vec<String>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        provider_names
            .into_iter()
            .filter_map(|name| {
                let name = name.as_ref();
                if !self.selectable(name) {
                    return None;
                }
                let include = match self.records.get(name) {
                    Some(health) => health.gets_a_chance(),
                    None => true,
                };
                include.then(|| name.to_string())
            })
            .collect()
    }

    /// Providers with a proven recent track record, best success rate first.
    ///
    /// Falls back to the seed list (restricted to `provider_names`) when no
    /// provider qualifies, so a cold monitor still has somewhere to start.
    pub fn reliable_candidates<I>(&self, provider_names: I) -> Vec<String>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.reliable_candidates_at(provider_names, Utc::now())
    }

    fn reliable_candidates_at<I>(&self, provider_names: I, now: DateTime<Utc>) -> Vec<String>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let available: Vec<String> = provider_names
            .into_iter()
            .map(|n| n.as_ref().to_string())
            .collect();

        let mut reliable: Vec<(String, f64)> = available
            .iter()
            .filter(|name| self.selectable(name))
            .filter_map(|name| {
                let health = self.records.get(name.as_str())?;
                health
                    .is_reliable_at(now)
                    .then(|| (name.clone(), health.success_rate()))
            })
            .collect();

        // Stable sort: ties keep input order.
        reliable.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        if !reliable.is_empty() {
            return reliable.into_iter().map(|(name, _)| name).collect();
        }

        self.seed_providers
            .iter()
            .filter(|seed| available.iter().any(|name| name == *seed))
            .filter(|seed| self.selectable(seed))
            .cloned()
            .collect()
    }

    fn selectable(&self, name: &str) -> bool {
        name != AUTO && !self.is_blacklisted(name)
    }

    /// Group every tracked provider by status, each bucket sorted by name.
    pub fn status_summary(&self) -> StatusSummary {
        let mut summary = StatusSummary::default();

        for entry in self.records.iter() {
            let line = ProviderSummary::from(entry.value());
            match line.status {
                HealthStatus::Healthy => summary.healthy.push(line),
                HealthStatus::Degraded => summary.degraded.push(line),
                HealthStatus::Unhealthy => summary.unhealthy.push(line),
                HealthStatus::Unknown => summary.unknown.push(line),
            }
        }

        for bucket in [
            &mut summary.healthy,
            &mut summary.degraded,
            &mut summary.unhealthy,
            &mut summary.unknown,
        ] {
            bucket.sort_by(|a, b| a.name.cmp(&b.name));
        }

        summary.blacklisted = self.blacklist.iter().map(|n| n.key().clone()).collect();
        summary.blacklisted.sort();
        summary
    }
}
