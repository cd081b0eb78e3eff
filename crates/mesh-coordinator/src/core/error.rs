//! Coordinator error type

use thiserror::Error;

use super::state::State;
use crate::managers::{QuoteError, RecoveryError, SecretError};
use crate::storage::StorageError;

/// Errors returned by coordinator operations
///
/// Every variant has a stable [`kind`](CoordinatorError::kind) used as the
/// machine-readable code at the HTTP boundary.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Operation '{operation}' not allowed in state {state}")]
    InvalidState { operation: &'static str, state: State },

    #[error("Unknown marble type: {0}")]
    UnknownMarbleType(String),

    #[error("Unknown package: {0}")]
    UnknownPackage(String),

    #[error("Marble type '{marble_type}' reached its limit of {limit} active instances")]
    MaxActivationsExceeded { marble_type: String, limit: u32 },

    #[error("Quote verification failed: {0}")]
    QuoteVerificationFailed(#[source] QuoteError),

    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    #[error("Secret '{0}' is not user-defined")]
    SecretNotUserDefined(String),

    #[error("Secret generation failed: {0}")]
    SecretGeneration(#[source] SecretError),

    #[error("Insufficient recovery shares: got {got}, need {need}")]
    RecoveryInsufficientShares { got: usize, need: usize },

    #[error("Unknown recovery key holder: {0}")]
    RecoveryUnknownHolder(String),

    #[error("Recovery share from '{0}' does not match the others")]
    RecoveryShareMismatch(String),

    #[error("Recovered key does not unseal stored state: {0}")]
    RecoveryUnsealFailed(String),

    #[error("Recovery failed: {0}")]
    Recovery(#[source] RecoveryError),

    #[error("Certificate issuance failed: {0}")]
    CertificateIssuanceFailed(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Instance already active: {0}")]
    InstanceAlreadyActive(String),

    #[error("Quote generation failed: {0}")]
    Quote(#[source] QuoteError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Initialization failed: {0}")]
    Initialization(String),
}

impl CoordinatorError {
    /// Stable machine-readable error code
    pub fn kind(&self) -> &'static str {
        match self {
            CoordinatorError::InvalidManifest(_) => "InvalidManifest",
            CoordinatorError::InvalidState { .. } => "InvalidStateForOperation",
            CoordinatorError::UnknownMarbleType(_) => "UnknownMarbleType",
            CoordinatorError::UnknownPackage(_) => "UnknownPackage",
            CoordinatorError::MaxActivationsExceeded { .. } => "MaxActivationsExceeded",
            CoordinatorError::QuoteVerificationFailed(_) => "QuoteVerificationFailed",
            CoordinatorError::SecretNotFound(_) => "SecretNotFound",
            CoordinatorError::SecretNotUserDefined(_) => "SecretNotUserDefined",
            CoordinatorError::SecretGeneration(_) => "SecretGenerationFailed",
            CoordinatorError::RecoveryInsufficientShares { .. } => "RecoveryInsufficientShares",
            CoordinatorError::RecoveryUnknownHolder(_) => "RecoveryUnknownHolder",
            CoordinatorError::RecoveryShareMismatch(_) => "RecoveryShareMismatch",
            CoordinatorError::RecoveryUnsealFailed(_) => "RecoveryUnsealFailed",
            CoordinatorError::Recovery(_) => "RecoveryFailed",
            CoordinatorError::CertificateIssuanceFailed(_) => "CertificateIssuanceFailed",
            CoordinatorError::InstanceNotFound(_) => "InstanceNotFound",
            CoordinatorError::InstanceAlreadyActive(_) => "InstanceAlreadyActive",
            CoordinatorError::Quote(_) => "QuoteUnavailable",
            CoordinatorError::Storage(_) => "StorageError",
            CoordinatorError::Initialization(_) => "InitializationFailed",
        }
    }
}

impl From<RecoveryError> for CoordinatorError {
    fn from(err: RecoveryError) -> Self {
        match err {
            RecoveryError::InsufficientShares { got, need } => {
                CoordinatorError::RecoveryInsufficientShares { got, need }
            }
            RecoveryError::UnknownHolder(holder) => CoordinatorError::RecoveryUnknownHolder(holder),
            RecoveryError::ShareMismatch(holder) => CoordinatorError::RecoveryShareMismatch(holder),
            other => CoordinatorError::Recovery(other),
        }
    }
}

impl From<SecretError> for CoordinatorError {
    fn from(err: SecretError) -> Self {
        match err {
            SecretError::NotFound(name) => CoordinatorError::SecretNotFound(name),
            SecretError::NotUserDefined(name) => CoordinatorError::SecretNotUserDefined(name),
            other => CoordinatorError::SecretGeneration(other),
        }
    }
}
