//! API request handlers

pub mod manifest;
pub mod marble;
pub mod recovery;
pub mod secrets;
pub mod status;

use std::sync::Arc;

use crate::core::Coordinator;

pub use manifest::{get_manifest, set_manifest, ManifestResponse, SetManifestRequest, SetManifestResponse};
pub use marble::{
    activate, deactivate, heartbeat, list_marbles, ActivateRequest, ActivateResponse, InstanceRequest,
    InstanceRequestAck, ListMarblesResponse,
};
pub use recovery::{recover, RecoverRequest, RecoverResponse};
pub use secrets::{get_secrets, set_secrets, SecretsResponse, SetSecretsRequest, SetSecretsResponse};
pub use status::{get_quote, get_status, QuoteQuery, QuoteResponse};

/// Application state shared across handlers
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}
