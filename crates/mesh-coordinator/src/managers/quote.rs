//! Quote Manager
//!
//! Generates the coordinator's own attestation evidence and verifies the
//! evidence marbles present at activation. Verification is delegated to an
//! [`AttestationVerifier`] so hardware backends can be plugged in; the
//! default [`ReportVerifier`] checks software attestation reports.

use mesh_core::{Package, PolicyViolation, QuoteReport};
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Evidence returned by a coordinator running in simulation mode
pub const SIMULATED_QUOTE: &[u8] = b"SIMULATED_QUOTE";

/// Errors from quote generation or verification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuoteError {
    #[error("Attestation hardware unavailable")]
    HardwareUnavailable,

    #[error("Malformed quote: {0}")]
    Malformed(String),

    #[error("Quote violates package policy: {0}")]
    Policy(#[from] PolicyViolation),

    #[error("Quote rejected: {0}")]
    Rejected(String),
}

/// Verifies attestation evidence against a package policy
pub trait AttestationVerifier: Send + Sync + Debug {
    fn verify(&self, quote: &[u8], package: &Package) -> Result<(), QuoteError>;
}

/// Verifier for JSON software attestation reports
#[derive(Debug, Default, Clone, Copy)]
pub struct ReportVerifier;

impl AttestationVerifier for ReportVerifier {
    fn verify(&self, quote: &[u8], package: &Package) -> Result<(), QuoteError> {
        if quote.is_empty() {
            return Err(QuoteError::Malformed("empty quote".into()));
        }
        let report = QuoteReport::from_bytes(quote).map_err(|e| QuoteError::Malformed(e.to_string()))?;
        report.check(package)?;
        Ok(())
    }
}

/// Quote Manager
#[derive(Debug)]
pub struct QuoteManager {
    simulation: bool,
    verifier: Arc<dyn AttestationVerifier>,
}

impl QuoteManager {
    pub fn new(simulation: bool, verifier: Arc<dyn AttestationVerifier>) -> Self {
        Self {
            simulation,
            verifier,
        }
    }

    pub fn is_simulation(&self) -> bool {
        self.simulation
    }

    /// Attestation evidence for the coordinator, bound to `nonce`
    ///
    /// Only simulation mode can produce evidence; there is no hardware
    /// backend to ask otherwise.
    pub fn generate_quote(&self, nonce: &[u8]) -> Result<Vec<u8>, QuoteError> {
        if self.simulation {
            debug!(nonce_len = nonce.len(), "Returning simulated quote");
            return Ok(SIMULATED_QUOTE.to_vec());
        }
        Err(QuoteError::HardwareUnavailable)
    }

    /// Verify a marble's quote against its package
    ///
    /// Simulation mode and debug packages accept any quote.
    pub fn verify_quote(&self, quote: &[u8], package: &Package) -> Result<(), QuoteError> {
        if self.simulation || package.debug {
            return Ok(());
        }
        self.verifier.verify(quote, package)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package() -> Package {
        Package {
            signer_id: Some("ab".repeat(32)),
            product_id: Some(1),
            security_version: Some(3),
            ..Default::default()
        }
    }

    fn manager(simulation: bool) -> QuoteManager {
        QuoteManager::new(simulation, Arc::new(ReportVerifier))
    }

    #[test]
    fn test_simulation_generates_fixed_quote() {
        assert_eq!(manager(true).generate_quote(b"n").unwrap(), SIMULATED_QUOTE);
        assert_eq!(
            manager(false).generate_quote(b"n").unwrap_err(),
            QuoteError::HardwareUnavailable
        );
    }

    #[test]
    fn test_simulation_accepts_anything() {
        assert!(manager(true).verify_quote(b"", &package()).is_ok());
    }

    #[test]
    fn test_debug_package_accepts_anything() {
        let pkg = Package {
            debug: true,
            ..Default::default()
        };
        assert!(manager(false).verify_quote(b"junk", &pkg).is_ok());
    }

    #[test]
    fn test_matching_report_accepted() {
        let quote = QuoteReport::for_package(&package()).to_bytes();
        assert!(manager(false).verify_quote(&quote, &package()).is_ok());
    }

    #[test]
    fn test_mismatching_report_rejected() {
        let mut report = QuoteReport::for_package(&package());
        report.security_version = 2;
        let err = manager(false)
            .verify_quote(&report.to_bytes(), &package())
            .unwrap_err();
        assert!(matches!(err, QuoteError::Policy(PolicyViolation::SecurityVersion { .. })));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            manager(false).verify_quote(b"not json", &package()),
            Err(QuoteError::Malformed(_))
        ));
        assert!(matches!(
            manager(false).verify_quote(b"", &package()),
            Err(QuoteError::Malformed(_))
        ));
    }

    #[derive(Debug)]
    struct RejectAll;

    impl AttestationVerifier for RejectAll {
        fn verify(&self, _quote: &[u8], _package: &Package) -> Result<(), QuoteError> {
            Err(QuoteError::Rejected("untrusted platform".into()))
        }
    }

    #[test]
    fn test_custom_verifier_is_used() {
        let qm = QuoteManager::new(false, Arc::new(RejectAll));
        let quote = QuoteReport::for_package(&package()).to_bytes();
        assert!(matches!(
            qm.verify_quote(&quote, &package()),
            Err(QuoteError::Rejected(_))
        ));
    }
}
