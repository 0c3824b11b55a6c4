//! Provider health monitoring.
//!
//! Tracks the empirical reliability of every upstream provider and derives
//! the candidate lists the orchestrator walks during failover.

mod monitor;

pub use monitor::{
    FailureCategory, HealthStatus, ProviderHealth, ProviderMonitor, ProviderSummary,
    StatusSummary, DEFAULT_BLACKLIST, DEFAULT_SEED_PROVIDERS,
};
