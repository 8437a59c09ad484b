use axum::extract::State;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use crate::services::registry::UserRegistry;

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Service status ("ok" while serving)
    pub status: String,
    /// API version
    pub version: String,
    /// Number of users with stored settings
    pub users: usize,
}

/// Health check endpoint.
///
/// Returns the service status, version and the size of the user registry.
#[utoipa::path(
    get,
    path = "/api/v1/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
    )
)]
pub async fn health_check(State(registry): State<UserRegistry>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        users: registry.len().await,
    })
}
