//! Status and attestation handlers

use axum::{
    extract::{Query, State},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::AppState;
use crate::api::{blocking, success, ApiResult};
use crate::core::Status;

/// Query of the quote endpoint
#[derive(Debug, Deserialize)]
pub struct QuoteQuery {
    /// Base64-encoded nonce bound into the quote
    #[serde(default)]
    pub nonce: String,
}

/// Coordinator attestation evidence
#[derive(Debug, Serialize)]
pub struct QuoteResponse {
    /// Base64-encoded quote
    pub quote: String,

    /// Base64-encoded PEM mesh root CA
    pub root_ca: String,

    /// Base64-encoded PEM certificate of the coordinator itself
    pub coordinator_cert: String,
}

/// Coordinator status
///
/// GET /api/v2/status
pub async fn get_status(State(state): State<Arc<AppState>>) -> ApiResult<Status> {
    Ok(success(state.coordinator.get_status()))
}

/// Coordinator quote and certificate chain
///
/// GET /api/v2/quote?nonce=<base64>
pub async fn get_quote(
    State(state): State<Arc<AppState>>,
    Query(query): Query<QuoteQuery>,
) -> ApiResult<QuoteResponse> {
    let nonce = STANDARD.decode(query.nonce.trim())?;
    let quote = blocking(&state, move |c| c.get_quote(&nonce)).await?;

    Ok(success(QuoteResponse {
        quote: STANDARD.encode(&quote.quote),
        root_ca: STANDARD.encode(&quote.root_ca),
        coordinator_cert: STANDARD.encode(&quote.coordinator_cert),
    }))
}
