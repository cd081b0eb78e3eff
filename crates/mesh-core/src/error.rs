//! Error types for manifest handling and template rendering

use thiserror::Error;

/// Result type alias using ManifestError
pub type Result<T> = std::result::Result<T, ManifestError>;

/// Errors raised while decoding or validating a manifest
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    /// The manifest could not be decoded
    #[error("Manifest decoding failed: {0}")]
    Decode(String),

    /// One or more validation rules failed
    ///
    /// Every violation is collected so operators can fix them in one pass.
    #[error("Manifest validation failed: {}", .0.join("; "))]
    Invalid(Vec<String>),

    /// Serialization to canonical JSON failed
    #[error("Manifest serialization failed: {0}")]
    Serialization(String),
}

impl ManifestError {
    /// The individual validation violations, if any
    pub fn violations(&self) -> &[String] {
        match self {
            ManifestError::Invalid(violations) => violations,
            _ => &[],
        }
    }
}

impl From<serde_json::Error> for ManifestError {
    fn from(err: serde_json::Error) -> Self {
        ManifestError::Decode(err.to_string())
    }
}

/// Errors raised while substituting secrets into a template
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// A placeholder referenced a secret the caller could not supply
    #[error("Template references unavailable secret '{name}'")]
    MissingSecret { name: String },

    /// A placeholder selected a field this secret does not carry
    #[error("Secret '{name}' has no field '{field}'")]
    MissingField { name: String, field: String },
}
