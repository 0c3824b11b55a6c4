//! freegate - HTTP gateway over free GPT-style upstream providers
//!
//! This library provides the core functionality for the freegate server:
//! configuration, the provider registry, per-provider health tracking and
//! the fallback orchestrator that turns one prompt into one answer.

pub mod api;
pub mod config;
pub mod error;
pub mod health;
pub mod normalize;
pub mod orchestrator;
pub mod provider;
pub mod sources;
pub mod storage;
pub mod validation;

pub use config::Config;
pub use error::{Error, Result};
