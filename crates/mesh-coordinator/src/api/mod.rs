//! HTTP API of the coordinator
//!
//! Every response uses the JSend envelope: `{"status": "success", "data": ...}`
//! on success, `{"status": "fail"|"error", "message": ..., "code": ...}` on
//! client and server errors. Binary values travel base64-encoded.

pub mod error;
pub mod handlers;

use axum::{
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::core::{Coordinator, CoordinatorError};
use error::ApiError;
use handlers::AppState;

/// JSend response envelope
#[derive(Debug, Serialize)]
pub struct JSend<T> {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

/// Wrap `data` in a success envelope
pub fn success<T: Serialize>(data: T) -> Json<JSend<T>> {
    Json(JSend {
        status: "success",
        data: Some(data),
        message: None,
        code: None,
    })
}

/// Result of a JSON handler
pub type ApiResult<T> = Result<Json<JSend<T>>, ApiError>;

/// Run a coordinator call on the blocking pool
///
/// Key generation and certificate issuance are CPU-bound and must not
/// stall the async workers.
pub(crate) async fn blocking<T, F>(state: &Arc<AppState>, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Coordinator) -> Result<T, CoordinatorError> + Send + 'static,
    T: Send + 'static,
{
    let coordinator = state.coordinator.clone();
    let result = tokio::task::spawn_blocking(move || f(&coordinator)).await?;
    result.map_err(ApiError::from)
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint
///
/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    })
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/v2/status", get(handlers::get_status))
        .route("/api/v2/quote", get(handlers::get_quote))
        // Manifest
        .route(
            "/api/v2/manifest",
            get(handlers::get_manifest).post(handlers::set_manifest),
        )
        // Secrets
        .route(
            "/api/v2/secrets",
            get(handlers::get_secrets).post(handlers::set_secrets),
        )
        .route("/api/v2/recover", post(handlers::recover))
        // Marbles
        .route("/api/v2/marble/activate", post(handlers::activate))
        .route("/api/v2/marble/heartbeat", post(handlers::heartbeat))
        .route("/api/v2/marble/deactivate", post(handlers::deactivate))
        .route("/api/v2/marbles", get(handlers::list_marbles))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
