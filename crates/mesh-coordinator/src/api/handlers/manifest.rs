//! Manifest handlers

use axum::{extract::State, Json};
use base64::{engine::general_purpose::STANDARD, Engine};
use mesh_core::Manifest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::AppState;
use crate::api::error::ApiError;
use crate::api::{blocking, success, ApiResult};
use crate::core::CoordinatorError;

/// Active manifest
#[derive(Debug, Serialize)]
pub struct ManifestResponse {
    /// Base64-encoded canonical manifest JSON
    pub manifest: String,

    /// Lowercase hex SHA-256 of the canonical JSON
    pub fingerprint: String,
}

/// Request to install the manifest
#[derive(Debug, Deserialize)]
pub struct SetManifestRequest {
    /// Base64-encoded manifest JSON
    pub manifest: String,
}

/// Recovery data for each holder named in the manifest
#[derive(Debug, Serialize)]
pub struct SetManifestResponse {
    /// Holder name to base64 RSA-OAEP ciphertext of the sealing key
    pub recovery_secrets: BTreeMap<String, String>,
}

/// Get the active manifest
///
/// GET /api/v2/manifest
pub async fn get_manifest(State(state): State<Arc<AppState>>) -> ApiResult<ManifestResponse> {
    let (manifest, fingerprint) = state
        .coordinator
        .get_manifest()
        .ok_or_else(|| ApiError::NotFound("No manifest has been set".into()))?;
    let canonical = manifest
        .to_canonical_json()
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(success(ManifestResponse {
        manifest: STANDARD.encode(canonical),
        fingerprint,
    }))
}

/// Install the manifest
///
/// POST /api/v2/manifest
///
/// Only accepted once, while the coordinator waits for a manifest.
pub async fn set_manifest(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SetManifestRequest>,
) -> ApiResult<SetManifestResponse> {
    let raw = STANDARD.decode(request.manifest.trim())?;
    let manifest = Manifest::from_json(&raw)
        .map_err(|e| CoordinatorError::InvalidManifest(e.to_string()))?;

    let recovery_data = blocking(&state, move |c| c.set_manifest(manifest)).await?;
    info!(holders = recovery_data.len(), "Manifest accepted over API");

    Ok(success(SetManifestResponse {
        recovery_secrets: recovery_data
            .into_iter()
            .map(|(holder, data)| (holder, STANDARD.encode(data)))
            .collect(),
    }))
}
