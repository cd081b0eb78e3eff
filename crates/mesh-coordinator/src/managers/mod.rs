//! Managers composed by the coordinator
//!
//! Each manager owns one concern and its own lock:
//! - `SecretManager`: generated and user-supplied secrets, the sealing key
//! - `TlsManager`: the mesh root CA and issued leaf identities
//! - `RecoveryManager`: per-holder encryption of the sealing key
//! - `QuoteManager`: attestation evidence generation and verification

pub mod quote;
pub mod recovery;
pub mod secrets;
pub mod tls;

pub use quote::{AttestationVerifier, QuoteError, QuoteManager, ReportVerifier, SIMULATED_QUOTE};
pub use recovery::{RecoveryError, RecoveryKeys, RecoveryManager};
pub use secrets::{GeneratedSecret, SecretBundle, SecretError, SecretManager, SecretMaterial, StagedSecrets};
pub use tls::{IssuedCert, IssuedIdentity, TlsError, TlsManager};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// The four managers of one running coordinator
pub struct Managers {
    pub secrets: SecretManager,
    pub tls: TlsManager,
    pub recovery: RecoveryManager,
    pub quote: QuoteManager,
}

/// Certificate serial numbers derived from the current time
///
/// Serials are the current Unix time in nanoseconds, bumped past the last
/// issued value so two certificates from one source never share a serial.
#[derive(Debug, Default)]
pub(crate) struct SerialSource {
    last: AtomicU64,
}

impl SerialSource {
    pub(crate) fn next(&self) -> rcgen::SerialNumber {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();

        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return rcgen::SerialNumber::from_slice(&candidate.to_be_bytes()),
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Set a validity window of `days` days starting now
pub(crate) fn set_validity(params: &mut rcgen::CertificateParams, days: u32) {
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(i64::from(days));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_serials_are_distinct() {
        let source = SerialSource::default();
        let serials: HashSet<Vec<u8>> = (0..1000).map(|_| source.next().to_bytes()).collect();
        assert_eq!(serials.len(), 1000);
    }
}
