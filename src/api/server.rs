//! HTTP server setup.

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::handlers::{self, FREEGATE_LATENCY_MS_HEADER, FREEGATE_REQUEST_ID_HEADER};
use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::provider::ProviderRegistry;
use crate::storage::{self, SqliteHistoryStore};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub config: Arc<Config>,
    /// Present when `[database]` is configured.
    pub db: Option<SqlitePool>,
}

/// Correlation ID assigned to every inbound request.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

/// Assign a request ID and stamp ID and latency headers on the way out.
async fn request_context(mut request: Request, next: Next) -> Response {
    let start = Instant::now();
    let request_id = RequestId(Uuid::new_v4());
    request.extensions_mut().insert(request_id);

    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id.0.to_string()) {
        headers.insert(HeaderName::from_static(FREEGATE_REQUEST_ID_HEADER), value);
    }
    headers.insert(
        HeaderName::from_static(FREEGATE_LATENCY_MS_HEADER),
        HeaderValue::from(start.elapsed().as_millis() as u64),
    );
    response
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    let max_concurrent = state.config.server.max_concurrent_requests.max(1);

    Router::new()
        // Plain-text endpoint: GET /?<keyword>=...
        .route("/", get(handlers::text_completion))
        // OpenAI-compatible endpoint
        .route("/v1/chat/completions", post(handlers::chat_completions))
        // Diagnostics and management
        .route("/models", get(handlers::list_models))
        .route("/health", get(handlers::health))
        .route("/providers", get(handlers::list_providers))
        .route("/providers/:name/blacklist", post(handlers::blacklist_provider))
        .with_state(state)
        .layer(middleware::from_fn(request_context))
        .layer(ConcurrencyLimitLayer::new(max_concurrent))
        .layer(TraceLayer::new_for_http())
}

/// Build state from `config`: registry, monitor, optional database and history.
pub async fn build_state(config: Config) -> anyhow::Result<AppState> {
    let registry = ProviderRegistry::from_config(&config)?;
    let mut orchestrator = Orchestrator::from_config(&config, Arc::new(registry));

    let db = match &config.database {
        Some(database) => {
            let pool = storage::init_pool(&database.path).await?;
            tracing::info!(path = %database.path, "Database ready");
            let history = SqliteHistoryStore::new(pool.clone());
            orchestrator = orchestrator.with_history(Arc::new(history));
            Some(pool)
        }
        None => None,
    };

    Ok(AppState {
        orchestrator: Arc::new(orchestrator),
        config: Arc::new(config),
        db,
    })
}

/// Run the HTTP server.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();
    let state = build_state(config).await?;
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting freegate server");

    axum::serve(listener, app).await?;

    Ok(())
}
