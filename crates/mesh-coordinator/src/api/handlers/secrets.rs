//! User secret handlers

use axum::{
    extract::{Query, State},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::AppState;
use crate::api::error::ApiError;
use crate::api::{blocking, success, ApiResult};

/// Secret values keyed by name, base64-encoded
#[derive(Serialize)]
pub struct SecretsResponse {
    pub secrets: BTreeMap<String, String>,
}

/// Names of the secrets that were set
#[derive(Debug, Serialize)]
pub struct SetSecretsResponse {
    pub names: Vec<String>,
}

/// Request to set user-defined secrets
#[derive(Debug, Deserialize)]
pub struct SetSecretsRequest {
    /// Secret name to base64-encoded value
    pub secrets: BTreeMap<String, String>,
}

/// Read secrets
///
/// GET /api/v2/secrets?name=a&name=b
pub async fn get_secrets(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Vec<(String, String)>>,
) -> ApiResult<SecretsResponse> {
    let names: Vec<String> = params
        .into_iter()
        .filter(|(key, _)| key == "name")
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
        .collect();
    if names.is_empty() {
        return Err(ApiError::BadRequest("At least one secret name is required".into()));
    }

    let values = state.coordinator.get_secrets(&names)?;
    Ok(success(SecretsResponse {
        secrets: values
            .iter()
            .map(|(name, value)| (name.clone(), STANDARD.encode(value.as_slice())))
            .collect(),
    }))
}

/// Set user-defined secrets
///
/// POST /api/v2/secrets
pub async fn set_secrets(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SetSecretsRequest>,
) -> ApiResult<SetSecretsResponse> {
    if request.secrets.is_empty() {
        return Err(ApiError::BadRequest("No secrets given".into()));
    }

    let mut values = BTreeMap::new();
    for (name, encoded) in &request.secrets {
        values.insert(name.clone(), STANDARD.decode(encoded.trim())?);
    }
    let names: Vec<String> = values.keys().cloned().collect();

    blocking(&state, move |c| c.set_secrets(&values)).await?;
    info!(count = names.len(), "User secrets set over API");

    Ok(success(SetSecretsResponse { names }))
}
