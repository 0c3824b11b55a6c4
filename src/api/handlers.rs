//! HTTP request handlers.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use std::collections::HashMap;
use std::time::Instant;

use super::server::{AppState, RequestId};
use super::types::{
    BlacklistRequest, ChatCompletionRequest, ChatCompletionResponse, Choice, ModelsQuery,
    TextQuery,
};
use crate::error::Error;
use crate::health::HealthStatus;
use crate::orchestrator::{format_attempts_header, AttemptRecord, GenerateRequest, Generation};
use crate::provider::{ChatMessage, AUTO};
use crate::storage::logging::{spawn_log_write, RequestLog};

/// Correlation ID for the request, present on every response.
pub const FREEGATE_REQUEST_ID_HEADER: &str = "x-freegate-request-id";
/// Wall-clock handling time in milliseconds, present on every response.
pub const FREEGATE_LATENCY_MS_HEADER: &str = "x-freegate-latency-ms";
/// Provider that produced the answer.
pub const FREEGATE_PROVIDER_HEADER: &str = "x-freegate-provider";
/// Failed attempts before the answer, as `name/category` pairs.
pub const FREEGATE_ATTEMPTS_HEADER: &str = "x-freegate-attempts";

/// Attach provider and attempt headers to a successful generation.
fn attach_freegate_headers(response: &mut Response, provider: &str, attempts: &[AttemptRecord]) {
    let headers = response.headers_mut();

    if let Ok(value) = HeaderValue::from_str(provider) {
        headers.insert(HeaderName::from_static(FREEGATE_PROVIDER_HEADER), value);
    }

    if let Some(failed) = format_attempts_header(attempts) {
        if let Ok(value) = HeaderValue::from_str(&failed) {
            headers.insert(HeaderName::from_static(FREEGATE_ATTEMPTS_HEADER), value);
        }
    }
}

/// Run one generation and log its outcome (fire-and-forget).
async fn execute(
    state: &AppState,
    request_id: RequestId,
    request: GenerateRequest,
) -> Result<Generation, Error> {
    let start = Instant::now();
    let defaults = state.orchestrator.defaults();
    let model = request.model.clone().unwrap_or_else(|| defaults.model.clone());
    let requested = request
        .provider
        .clone()
        .unwrap_or_else(|| defaults.provider.clone());

    let result = state.orchestrator.generate_response(request).await;

    let latency_ms = start.elapsed().as_millis() as i64;
    if let Some(pool) = state.db.as_ref().filter(|_| state.config.logging.log_requests) {
        let log_entry = match &result {
            Ok(generation) => RequestLog {
                correlation_id: request_id.0.to_string(),
                timestamp: chrono::Utc::now().to_rfc3339(),
                model: generation.model.clone(),
                requested_provider: generation.requested_provider.clone(),
                provider: Some(generation.provider.clone()),
                attempts: generation.attempts.len() as u32,
                latency_ms,
                success: true,
                error_message: None,
            },
            Err(e) => RequestLog {
                correlation_id: request_id.0.to_string(),
                timestamp: chrono::Utc::now().to_rfc3339(),
                model,
                requested_provider: requested,
                provider: None,
                attempts: match e {
                    Error::AllProvidersFailed { attempts, .. } => *attempts as u32,
                    _ => 0,
                },
                latency_ms,
                success: false,
                error_message: Some(e.to_string()),
            },
        };
        spawn_log_write(pool, log_entry);
    }

    result
}

/// Handle GET /?<keyword>=... - plain-text answer
pub async fn text_completion(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Query(params): Query<HashMap<String, String>>,
    Query(query): Query<TextQuery>,
) -> Result<Response, Error> {
    let keyword = &state.config.server.keyword;
    let message = params
        .get(keyword)
        .cloned()
        .ok_or_else(|| Error::Validation(format!("Missing '{}' parameter", keyword)))?;

    let request = GenerateRequest {
        message,
        provider: query.provider,
        model: query.model,
        system_prompt: query.system_prompt,
        use_history: query.user.is_some(),
        username: query.user,
        strip_citations: query.remove_sources,
        use_proxy: None,
        cookie_file: None,
    };

    let generation = execute(&state, request_id, request).await?;
    let mut response = (StatusCode::OK, generation.text).into_response();
    attach_freegate_headers(&mut response, &generation.provider, &generation.attempts);
    Ok(response)
}

/// Handle POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, Error> {
    if request.stream == Some(true) {
        return Err(Error::Validation("Streaming responses are not supported".to_string()));
    }

    let message = request
        .user_prompt()
        .ok_or_else(|| Error::Validation("No user message in request".to_string()))?
        .to_string();

    let generate = GenerateRequest {
        message,
        provider: request.provider.clone(),
        model: request.model.clone(),
        system_prompt: request.system_prompt().map(str::to_string),
        use_history: request.user.is_some(),
        username: request.user.clone(),
        strip_citations: request.remove_sources,
        use_proxy: None,
        cookie_file: None,
    };

    let generation = execute(&state, request_id, generate).await?;

    let body = ChatCompletionResponse {
        id: format!("chatcmpl-{}", request_id.0.simple()),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp().max(0) as u64,
        model: generation.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: ChatMessage::assistant(generation.text.clone()),
            finish_reason: Some("stop".to_string()),
        }],
        freegate_provider: generation.provider.clone(),
    };

    let mut response = Json(body).into_response();
    attach_freegate_headers(&mut response, &generation.provider, &generation.attempts);
    Ok(response)
}

/// Handle GET /models?provider=... - models offered by one provider
pub async fn list_models(
    State(state): State<AppState>,
    Query(query): Query<ModelsQuery>,
) -> Result<Json<serde_json::Value>, Error> {
    let provider = query
        .provider
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| state.orchestrator.defaults().provider.clone());

    let models: Vec<serde_json::Value> = state
        .orchestrator
        .available_models(&provider)?
        .into_iter()
        .map(|model| {
            serde_json::json!({
                "id": model,
                "object": "model",
                "owned_by": provider,
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "object": "list",
        "provider": provider,
        "data": models
    })))
}

/// Overall service status derived from provider health.
///
/// `unhealthy` when nothing is left to route to, `degraded` when some
/// provider is unhealthy, `ok` otherwise.
fn service_status(state: &AppState) -> &'static str {
    let orchestrator = &state.orchestrator;
    let monitor = orchestrator.monitor();
    let registry = orchestrator.registry();

    let usable = |name: &str| {
        !monitor.is_blacklisted(name) && monitor.status(name) != HealthStatus::Unhealthy
    };

    let auto_usable = registry.auto().is_some() && usable(AUTO);
    let any_usable = auto_usable || registry.names().iter().any(|name| usable(name.as_str()));
    if !any_usable {
        return "unhealthy";
    }

    let summary = orchestrator.status_summary();
    if summary.unhealthy.is_empty() {
        "ok"
    } else {
        "degraded"
    }
}

/// Handle GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let status = service_status(&state);
    let code = if status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        code,
        Json(serde_json::json!({
            "status": status,
            "service": "freegate",
            "providers": state.orchestrator.status_summary(),
        })),
    )
}

/// Handle GET /providers - registered providers with their health
pub async fn list_providers(State(state): State<AppState>) -> impl IntoResponse {
    let orchestrator = &state.orchestrator;
    let monitor = orchestrator.monitor();
    let registry = orchestrator.registry();

    let mut names: Vec<&str> = Vec::new();
    if registry.auto().is_some() {
        names.push(AUTO);
    }
    names.extend(registry.names().iter().map(String::as_str));

    let providers: Vec<serde_json::Value> = names
        .into_iter()
        .map(|name| {
            let health = monitor.health(name);
            serde_json::json!({
                "name": name,
                "status": monitor.status(name),
                "success_rate": health.as_ref().map(|h| h.success_rate()),
                "total_calls": health.as_ref().map(|h| h.total_calls()).unwrap_or(0),
                "blacklisted": monitor.is_blacklisted(name),
                "models": orchestrator.available_models(name).unwrap_or_default(),
            })
        })
        .collect();

    Json(serde_json::json!({
        "providers": providers
    }))
}

/// Handle POST /providers/:name/blacklist
pub async fn blacklist_provider(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<BlacklistRequest>>,
) -> Result<Json<serde_json::Value>, Error> {
    if name == AUTO {
        return Err(Error::Validation("Auto cannot be blacklisted".to_string()));
    }
    if !state.orchestrator.registry().contains(&name) {
        return Err(Error::UnknownProvider(name));
    }

    let reason = body
        .and_then(|Json(b)| b.reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "manual".to_string());
    state.orchestrator.monitor().blacklist(&name, &reason);

    Ok(Json(serde_json::json!({
        "provider": name,
        "blacklisted": true,
        "reason": reason
    })))
}
