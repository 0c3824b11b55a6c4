//! HTTP API.
//!
//! A plain-text `GET /` endpoint, an OpenAI-compatible chat endpoint, and
//! health and provider management routes, all backed by one [`Orchestrator`].
//!
//! [`Orchestrator`]: crate::orchestrator::Orchestrator

mod handlers;
mod server;
pub mod types;

pub use handlers::{
    FREEGATE_ATTEMPTS_HEADER, FREEGATE_LATENCY_MS_HEADER, FREEGATE_PROVIDER_HEADER,
    FREEGATE_REQUEST_ID_HEADER,
};
pub use server::{build_state, create_router, run_server, AppState, RequestId};
