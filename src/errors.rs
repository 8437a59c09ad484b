use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

/// Standard error response body.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Weather provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Invalid forecast data: {0}")]
    InvalidForecastData(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Messaging error: {0}")]
    MessagingError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::ProviderUnavailable(msg) | AppError::MessagingError(msg) => {
                tracing::warn!("Upstream error: {}", self);
                (StatusCode::BAD_GATEWAY, msg.clone())
            }
            AppError::PersistenceFailure(err) => {
                tracing::error!("Persistence failure: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal storage error".to_string(),
                )
            }
            AppError::InvalidForecastData(msg)
            | AppError::ConfigError(msg)
            | AppError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        (status, axum::Json(ErrorResponse { error: message })).into_response()
    }
}
