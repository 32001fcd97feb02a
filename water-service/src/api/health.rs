use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub backend: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub residents: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// GET /health: ready when the store answers a roster listing.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let backend = state.store.backend();
    match state.store.list_residents().await {
        Ok(residents) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                backend,
                residents: Some(residents.len()),
                error: None,
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, backend, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unavailable",
                    backend,
                    residents: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}
