//! Error types for freegate.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::health::StatusSummary;

/// Result type alias for freegate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for freegate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Unknown provider '{0}'")]
    UnknownProvider(String),

    /// Every step of the fallback chain failed.
    #[error("All providers failed after {attempts} attempts")]
    AllProvidersFailed {
        attempts: usize,
        summary: Box<StatusSummary>,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::UnknownProvider(_) => StatusCode::NOT_FOUND,
            Error::AllProvidersFailed { .. } => StatusCode::BAD_GATEWAY,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // OpenAI-compatible error format
        let mut body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": "freegate_error",
                "code": status.as_u16()
            }
        });

        if let Error::AllProvidersFailed { summary, .. } = &self {
            if let Ok(summary) = serde_json::to_value(summary.as_ref()) {
                body["error"]["providers"] = summary;
            }
        }

        (status, axum::Json(body)).into_response()
    }
}
