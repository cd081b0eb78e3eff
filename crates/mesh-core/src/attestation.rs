//! Software attestation report
//!
//! Emulated runtimes present their identity as a JSON report instead of a
//! hardware-signed quote. The fields mirror what a hardware quote reports:
//! enclave measurement, signer measurement, product id and security version.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::manifest::Package;

/// Identity reported by an attesting runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteReport {
    /// Enclave measurement (hex)
    pub unique_id: String,

    /// Signer measurement (hex)
    pub signer_id: String,

    pub product_id: u16,

    pub security_version: u16,

    /// Whether the reporting enclave runs in debug mode
    #[serde(default)]
    pub debug: bool,

    /// Caller-bound data (base64), e.g. a hash of the CSR
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub report_data: String,
}

/// Why a report does not satisfy a package policy
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyViolation {
    #[error("UniqueID mismatch: expected {expected}, got {actual}")]
    UniqueId { expected: String, actual: String },

    #[error("SignerID mismatch: expected {expected}, got {actual}")]
    SignerId { expected: String, actual: String },

    #[error("ProductID mismatch: expected {expected}, got {actual}")]
    ProductId { expected: u16, actual: u16 },

    #[error("SecurityVersion {actual} below required {required}")]
    SecurityVersion { required: u16, actual: u16 },

    #[error("debug enclave not allowed for non-debug package")]
    DebugEnclave,
}

impl QuoteReport {
    /// A report matching `package` exactly
    pub fn for_package(package: &Package) -> Self {
        Self {
            unique_id: package.unique_id.clone().unwrap_or_default(),
            signer_id: package.signer_id.clone().unwrap_or_default(),
            product_id: package.product_id.unwrap_or_default(),
            security_version: package.security_version.unwrap_or_default(),
            debug: package.debug,
            report_data: String::new(),
        }
    }

    /// Bind caller data into the report
    pub fn with_report_data(mut self, data: &[u8]) -> Self {
        self.report_data = STANDARD.encode(data);
        self
    }

    /// Encode as quote bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing plain strings and integers cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode quote bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Check the reported identity against a package policy
    ///
    /// Measurements are compared case-insensitively since they are hex.
    /// Fields the package leaves undeclared are not checked.
    pub fn check(&self, package: &Package) -> Result<(), PolicyViolation> {
        if let Some(expected) = package.unique_id.as_deref().filter(|s| !s.is_empty()) {
            if !expected.eq_ignore_ascii_case(&self.unique_id) {
                return Err(PolicyViolation::UniqueId {
                    expected: expected.to_string(),
                    actual: self.unique_id.clone(),
                });
            }
        }
        if let Some(expected) = package.signer_id.as_deref().filter(|s| !s.is_empty()) {
            if !expected.eq_ignore_ascii_case(&self.signer_id) {
                return Err(PolicyViolation::SignerId {
                    expected: expected.to_string(),
                    actual: self.signer_id.clone(),
                });
            }
        }
        if let Some(expected) = package.product_id {
            if expected != self.product_id {
                return Err(PolicyViolation::ProductId {
                    expected,
                    actual: self.product_id,
                });
            }
        }
        if let Some(required) = package.security_version {
            if self.security_version < required {
                return Err(PolicyViolation::SecurityVersion {
                    required,
                    actual: self.security_version,
                });
            }
        }
        if self.debug && !package.debug {
            return Err(PolicyViolation::DebugEnclave);
        }
        Ok(())
    }
}
