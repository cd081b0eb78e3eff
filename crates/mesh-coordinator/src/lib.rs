//! Mesh Coordinator
//!
//! Control plane of a confidential service mesh. The coordinator:
//! - Accepts one manifest that fixes packages, marble types, secrets and TLS
//! - Verifies the attestation quote of every marble before admitting it
//! - Provisions admitted marbles with secrets, rendered configuration and a
//!   mesh TLS identity signed by its own root CA
//! - Seals its state and recovers it from recovery-holder shares when the
//!   sealing key is lost
//!
//! ## Managers
//!
//! - [`SecretManager`]: generates and stores secrets, owns the sealing key
//! - [`TlsManager`]: mesh root CA and marble certificates
//! - [`RecoveryManager`]: recovery-holder keys and share reconstruction
//! - [`QuoteManager`]: attestation quote generation and verification
//!
//! ## API Endpoints
//!
//! - `GET /health` - Liveness check
//! - `GET /api/v2/status` - State, fingerprint and counters
//! - `GET /api/v2/quote?nonce=` - Coordinator quote and certificate chain
//! - `GET|POST /api/v2/manifest` - Read or install the manifest
//! - `GET|POST /api/v2/secrets` - Read secrets or set user-defined ones
//! - `POST /api/v2/recover` - Submit decrypted recovery shares
//! - `POST /api/v2/marble/activate` - Admit and provision a marble
//! - `POST /api/v2/marble/heartbeat` - Refresh a live instance
//! - `POST /api/v2/marble/deactivate` - Release an activation slot
//! - `GET /api/v2/marbles` - List live instances

pub mod api;
pub mod config;
pub mod core;
pub mod managers;
pub mod storage;

pub use api::create_router;
pub use api::handlers::AppState;
pub use config::{ConfigError, CoordinatorConfig, SealMode, ServerConfig};
pub use core::{
    ActivationRequest, ActivationResponse, Coordinator, CoordinatorError, CoordinatorQuote, MarbleInstance,
    State, Stats, Status,
};
pub use managers::{QuoteManager, RecoveryManager, SecretManager, TlsManager};
pub use storage::{FileStore, MemoryStore, SealedStateStore};
