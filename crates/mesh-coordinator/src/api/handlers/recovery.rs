//! Recovery handler

use axum::{extract::State, Json};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use zeroize::Zeroize;

use super::AppState;
use crate::api::error::ApiError;
use crate::api::{blocking, success, ApiResult};
use crate::core::State as CoordinatorState;

/// Decrypted recovery shares
#[derive(Deserialize)]
pub struct RecoverRequest {
    /// Holder name to base64-encoded decrypted share
    pub recovery_secrets: BTreeMap<String, String>,
}

/// Result of a recovery attempt
#[derive(Debug, Serialize)]
pub struct RecoverResponse {
    pub state: CoordinatorState,
}

/// Recover sealed state
///
/// POST /api/v2/recover
pub async fn recover(
    State(state): State<Arc<AppState>>,
    Json(mut request): Json<RecoverRequest>,
) -> ApiResult<RecoverResponse> {
    if request.recovery_secrets.is_empty() {
        return Err(ApiError::BadRequest("No recovery secrets given".into()));
    }

    let mut shares = BTreeMap::new();
    for (holder, encoded) in &request.recovery_secrets {
        shares.insert(holder.clone(), STANDARD.decode(encoded.trim())?);
    }
    for encoded in request.recovery_secrets.values_mut() {
        encoded.zeroize();
    }

    let recovered = blocking(&state, move |c| {
        let result = c.recover(&shares);
        for share in shares.values_mut() {
            share.zeroize();
        }
        result.map(|_| c.state())
    })
    .await?;

    Ok(success(RecoverResponse { state: recovered }))
}
