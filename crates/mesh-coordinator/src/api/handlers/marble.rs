//! Marble activation handlers
//!
//! Marbles call these to join the mesh, keep their instance alive and leave.

use axum::{extract::State, Json};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::AppState;
use crate::api::{blocking, success, ApiResult};
use crate::core::{ActivationRequest, MarbleInstance};

/// Activation request
#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    /// Marble type from the manifest
    pub marble_type: String,

    /// Requested instance id; assigned when empty
    #[serde(default)]
    pub uuid: String,

    /// Base64-encoded attestation quote
    #[serde(default)]
    pub quote: String,

    /// Base64-encoded certificate signing request (PEM or DER)
    #[serde(default, rename = "csr_pem", alias = "csr")]
    pub csr: Option<String>,
}

/// Everything a marble is provisioned with
///
/// Secret values, file contents, certificates and keys are base64-encoded.
#[derive(Serialize)]
pub struct ActivateResponse {
    pub uuid: String,
    pub secrets: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub files: BTreeMap<String, String>,
    pub argv: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_ca: Option<String>,
}

/// Request naming one instance
#[derive(Debug, Deserialize)]
pub struct InstanceRequest {
    pub uuid: String,
}

/// Live instances
#[derive(Debug, Serialize)]
pub struct ListMarblesResponse {
    pub marbles: Vec<MarbleInstance>,
    pub count: usize,
}

/// Activate a marble
///
/// POST /api/v2/marble/activate
pub async fn activate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ActivateRequest>,
) -> ApiResult<ActivateResponse> {
    let quote = STANDARD.decode(request.quote.trim())?;
    let csr = match request.csr.as_deref().map(str::trim) {
        Some(csr) if !csr.is_empty() => Some(STANDARD.decode(csr)?),
        _ => None,
    };
    let req = ActivationRequest {
        marble_type: request.marble_type,
        instance_id: request.uuid,
        quote,
        csr,
    };

    let resp = blocking(&state, move |c| c.activate(req)).await?;

    Ok(success(ActivateResponse {
        uuid: resp.instance_id.clone(),
        secrets: resp
            .secrets
            .iter()
            .map(|(k, v)| (k.clone(), STANDARD.encode(v.as_slice())))
            .collect(),
        env: resp
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect(),
        files: resp
            .files
            .iter()
            .map(|(k, v)| (k.clone(), STANDARD.encode(v.as_slice())))
            .collect(),
        argv: resp.argv.clone(),
        certificate: resp.certificate.as_deref().map(|c| STANDARD.encode(c)),
        private_key: resp.private_key.as_ref().map(|k| STANDARD.encode(k.as_slice())),
        root_ca: resp.root_ca.as_deref().map(|c| STANDARD.encode(c)),
    }))
}

/// Refresh an instance's last-seen time
///
/// POST /api/v2/marble/heartbeat
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InstanceRequest>,
) -> ApiResult<InstanceRequestAck> {
    state.coordinator.heartbeat(&request.uuid)?;
    Ok(success(InstanceRequestAck { uuid: request.uuid }))
}

/// Deactivate an instance
///
/// POST /api/v2/marble/deactivate
pub async fn deactivate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InstanceRequest>,
) -> ApiResult<InstanceRequestAck> {
    state.coordinator.deactivate(&request.uuid)?;
    Ok(success(InstanceRequestAck { uuid: request.uuid }))
}

/// Acknowledgement naming the instance acted on
#[derive(Debug, Serialize)]
pub struct InstanceRequestAck {
    pub uuid: String,
}

/// List live instances
///
/// GET /api/v2/marbles
pub async fn list_marbles(State(state): State<Arc<AppState>>) -> ApiResult<ListMarblesResponse> {
    let marbles = state.coordinator.list_instances();
    let count = marbles.len();
    Ok(success(ListMarblesResponse { marbles, count }))
}
