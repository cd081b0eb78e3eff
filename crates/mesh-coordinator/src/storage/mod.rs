//! Storage abstraction for sealed coordinator state
//!
//! The coordinator persists one sealed record: its manifest, secrets and
//! mesh CA, encrypted under the sealing key. Backends only move opaque
//! records around:
//! - `MemoryStore`: process-local, lost on exit (tests, development)
//! - `FileStore`: one JSON file in a state directory

pub mod file;
pub mod memory;
pub mod sealing;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use sealing::{SealedBlob, StateSnapshot};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Current sealed record format
pub const SEALED_RECORD_VERSION: u32 = 1;

/// Error type for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Sealing failed: {0}")]
    Seal(String),

    #[error("Unsealing failed: {0}")]
    Unseal(String),

    #[error("Unsupported sealed record version {0}")]
    UnsupportedVersion(u32),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Persisted coordinator state
///
/// `state` is readable only with the sealing key. `wrapped_key` carries the
/// sealing key itself, sealed under the platform key, when one is
/// configured. Recovery holders' public keys stay in the clear so a
/// coordinator that cannot unwrap the key knows whose shares to accept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedRecord {
    pub version: u32,

    pub state: SealedBlob,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped_key: Option<SealedBlob>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub recovery_keys: BTreeMap<String, String>,

    /// Fingerprint of the sealed manifest
    pub manifest_fingerprint: String,

    pub sealed_at: DateTime<Utc>,
}

/// Sealed state storage backend
///
/// Implementations must be thread-safe (Send + Sync).
pub trait SealedStateStore: Send + Sync + Debug {
    /// Load the stored record, if any
    fn load(&self) -> Result<Option<SealedRecord>, StorageError>;

    /// Replace the stored record
    fn store(&self, record: &SealedRecord) -> Result<(), StorageError>;

    /// Remove the stored record
    fn clear(&self) -> Result<(), StorageError>;
}
