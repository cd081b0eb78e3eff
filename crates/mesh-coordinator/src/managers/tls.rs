//! TLS Manager
//!
//! Owns the mesh root CA. Every activated marble that declares TLS
//! endpoints receives a leaf certificate signed by this CA, so marbles
//! authenticate each other by chaining to one root.

use base64::{engine::general_purpose::STANDARD, Engine};
use mesh_core::TlsConfig;
use parking_lot::RwLock;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info};
use zeroize::{Zeroize, Zeroizing};

use super::{set_validity, SerialSource};

const CA_VALIDITY_DAYS: u32 = 3650;
const LEAF_VALIDITY_DAYS: u32 = 365;

/// Errors from the TLS manager
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Certificate generation failed: {0}")]
    Generation(String),

    #[error("Invalid certificate signing request: {0}")]
    InvalidCsr(String),

    #[error("Invalid CA material: {0}")]
    InvalidCa(String),

    #[error("Mesh CA has been zeroed")]
    Zeroed,
}

impl From<rcgen::Error> for TlsError {
    fn from(err: rcgen::Error) -> Self {
        TlsError::Generation(err.to_string())
    }
}

/// Identity handed to an activated marble
pub struct IssuedIdentity {
    /// Leaf certificate (PEM)
    pub certificate: Vec<u8>,

    /// Leaf private key (PEM); `None` when the marble supplied a CSR
    pub private_key: Option<Zeroizing<Vec<u8>>>,

    /// Mesh root CA certificate (PEM)
    pub root_ca: Vec<u8>,
}

/// Record of a certificate issued to one instance
pub struct IssuedCert {
    pub marble_name: String,
    pub instance_id: String,
    pub certificate: Vec<u8>,
    pub private_key: Option<Zeroizing<Vec<u8>>>,
}

struct MeshCa {
    cert: Certificate,
    key: KeyPair,
    /// PEM as first issued; kept verbatim across restarts
    pem: String,
}

struct TlsState {
    ca: Option<MeshCa>,
    policy: TlsConfig,
    issued: HashMap<String, IssuedCert>,
    coordinator_cert: Vec<u8>,
    coordinator_key: Zeroizing<Vec<u8>>,
}

/// TLS Manager
pub struct TlsManager {
    organization: String,
    mesh_domain: String,
    dns_names: Vec<String>,
    serials: SerialSource,
    state: RwLock<TlsState>,
}

impl TlsManager {
    /// Create a manager with a freshly generated mesh root CA
    ///
    /// A coordinator certificate for `dns_names` is issued under the new
    /// root so clients can pin the root and reach the coordinator.
    pub fn new(
        organization: impl Into<String>,
        mesh_domain: impl Into<String>,
        dns_names: Vec<String>,
    ) -> Result<Self, TlsError> {
        let manager = Self {
            organization: organization.into(),
            mesh_domain: mesh_domain.into(),
            dns_names,
            serials: SerialSource::default(),
            state: RwLock::new(TlsState {
                ca: None,
                policy: TlsConfig::default(),
                issued: HashMap::new(),
                coordinator_cert: Vec::new(),
                coordinator_key: Zeroizing::new(Vec::new()),
            }),
        };

        let ca = manager.create_ca()?;
        manager.install_ca(ca)?;

        info!(
            organization = %manager.organization,
            mesh_domain = %manager.mesh_domain,
            "Mesh root CA generated"
        );
        Ok(manager)
    }

    fn create_ca(&self) -> Result<MeshCa, TlsError> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("{} Root CA", self.organization));
        dn.push(DnType::OrganizationName, self.organization.as_str());
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(1));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params, CA_VALIDITY_DAYS);
        params.serial_number = Some(self.serials.next());

        let cert = params.self_signed(&key)?;
        let pem = cert.pem();
        Ok(MeshCa { cert, key, pem })
    }

    /// Install a CA and reissue the coordinator certificate under it
    fn install_ca(&self, ca: MeshCa) -> Result<(), TlsError> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
        let mut params = self.leaf_params("coordinator", &self.dns_names)?;
        params.distinguished_name = {
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, "Mesh Coordinator");
            dn.push(DnType::OrganizationName, self.organization.as_str());
            dn
        };
        let cert = params.signed_by(&key, &ca.cert, &ca.key)?;

        let mut state = self.state.write();
        state.coordinator_cert = cert.pem().into_bytes();
        state.coordinator_key = Zeroizing::new(key.serialize_pem().into_bytes());
        state.ca = Some(ca);
        Ok(())
    }

    fn leaf_params(&self, common_name: &str, names: &[String]) -> Result<CertificateParams, TlsError> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, self.organization.as_str());
        params.distinguished_name = dn;

        for name in names {
            let dns = Ia5String::try_from(name.as_str())?;
            params.subject_alt_names.push(SanType::DnsName(dns));
        }

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        set_validity(&mut params, LEAF_VALIDITY_DAYS);
        params.serial_number = Some(self.serials.next());
        Ok(params)
    }

    // =========================================================================
    // Policy
    // =========================================================================

    /// Record the mesh-wide TLS policy of the active manifest
    pub fn initialize(&self, policy: &TlsConfig) {
        let mut state = self.state.write();
        state.policy = policy.clone();
        debug!(
            incoming = policy.incoming.len(),
            outgoing = policy.outgoing.len(),
            "TLS policy installed"
        );
    }

    /// Current mesh-wide TLS policy
    pub fn policy(&self) -> TlsConfig {
        self.state.read().policy.clone()
    }

    // =========================================================================
    // Issuance
    // =========================================================================

    /// Issue a leaf certificate for one marble instance
    ///
    /// SANs are the marble name, the instance id and
    /// `<marble>.<mesh domain>`. With a CSR (PEM, or DER) the certificate
    /// binds the CSR's public key and no private key is returned.
    pub fn issue_certificate(
        &self,
        marble_name: &str,
        instance_id: &str,
        csr: Option<&[u8]>,
    ) -> Result<IssuedIdentity, TlsError> {
        let names = vec![
            marble_name.to_string(),
            instance_id.to_string(),
            format!("{}.{}", marble_name, self.mesh_domain),
        ];
        let params = self.leaf_params(marble_name, &names)?;

        let (certificate, private_key, root_ca) = {
            let state = self.state.read();
            let ca = state.ca.as_ref().ok_or(TlsError::Zeroed)?;

            match csr {
                Some(csr) => {
                    let csr = parse_csr(csr)?;
                    let cert = params.signed_by(&csr.public_key, &ca.cert, &ca.key)?;
                    (cert.pem().into_bytes(), None, ca.pem.clone().into_bytes())
                }
                None => {
                    let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
                    let cert = params.signed_by(&key, &ca.cert, &ca.key)?;
                    let key_pem = Zeroizing::new(key.serialize_pem().into_bytes());
                    (cert.pem().into_bytes(), Some(key_pem), ca.pem.clone().into_bytes())
                }
            }
        };

        let mut state = self.state.write();
        state.issued.insert(
            instance_id.to_string(),
            IssuedCert {
                marble_name: marble_name.to_string(),
                instance_id: instance_id.to_string(),
                certificate: certificate.clone(),
                private_key: private_key.clone(),
            },
        );

        info!(
            marble = %marble_name,
            instance_id = %instance_id,
            from_csr = private_key.is_none(),
            "Issued marble certificate"
        );

        Ok(IssuedIdentity {
            certificate,
            private_key,
            root_ca,
        })
    }

    /// Forget the certificate issued to an instance
    pub fn revoke(&self, instance_id: &str) -> bool {
        let mut state = self.state.write();
        match state.issued.remove(instance_id) {
            Some(mut issued) => {
                if let Some(key) = issued.private_key.as_mut() {
                    key.zeroize();
                }
                debug!(instance_id = %instance_id, "Dropped issued certificate");
                true
            }
            None => false,
        }
    }

    /// Number of currently tracked leaf certificates
    pub fn issued_count(&self) -> usize {
        self.state.read().issued.len()
    }

    /// Certificate issued to an instance, if tracked
    pub fn issued_certificate(&self, instance_id: &str) -> Option<Vec<u8>> {
        self.state
            .read()
            .issued
            .get(instance_id)
            .map(|c| c.certificate.clone())
    }

    // =========================================================================
    // CA material
    // =========================================================================

    /// Mesh root CA certificate (PEM)
    pub fn root_ca_pem(&self) -> Result<Vec<u8>, TlsError> {
        let state = self.state.read();
        let ca = state.ca.as_ref().ok_or(TlsError::Zeroed)?;
        Ok(ca.pem.clone().into_bytes())
    }

    /// Coordinator's own certificate (PEM), chaining to the mesh root
    pub fn coordinator_cert_pem(&self) -> Result<Vec<u8>, TlsError> {
        let state = self.state.read();
        if state.ca.is_none() {
            return Err(TlsError::Zeroed);
        }
        Ok(state.coordinator_cert.clone())
    }

    /// CA certificate and private key, both PEM, for sealed state
    pub fn export_ca(&self) -> Result<(String, Zeroizing<String>), TlsError> {
        let state = self.state.read();
        let ca = state.ca.as_ref().ok_or(TlsError::Zeroed)?;
        Ok((ca.pem.clone(), Zeroizing::new(ca.key.serialize_pem())))
    }

    /// Replace the mesh root CA with one restored from sealed state
    pub fn restore_ca(&self, cert_pem: &str, key_pem: &str) -> Result<(), TlsError> {
        let key = KeyPair::from_pem(key_pem).map_err(|e| TlsError::InvalidCa(e.to_string()))?;
        let params =
            CertificateParams::from_ca_cert_pem(cert_pem).map_err(|e| TlsError::InvalidCa(e.to_string()))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| TlsError::InvalidCa(e.to_string()))?;

        self.install_ca(MeshCa {
            cert,
            key,
            pem: cert_pem.to_string(),
        })?;

        info!("Mesh root CA restored from sealed state");
        Ok(())
    }

    /// Drop the CA key and wipe every issued private key
    pub fn zero(&self) {
        let mut state = self.state.write();
        for issued in state.issued.values_mut() {
            if let Some(key) = issued.private_key.as_mut() {
                key.zeroize();
            }
        }
        state.issued.clear();
        state.coordinator_key.zeroize();
        state.coordinator_cert.clear();
        state.ca = None;
        info!("TLS manager zeroed");
    }
}

/// Parse a CSR given as PEM or raw DER
fn parse_csr(csr: &[u8]) -> Result<CertificateSigningRequestParams, TlsError> {
    let pem = match std::str::from_utf8(csr) {
        Ok(text) if text.trim_start().starts_with("-----BEGIN") => text.to_string(),
        _ => der_to_pem("CERTIFICATE REQUEST", csr),
    };
    CertificateSigningRequestParams::from_pem(&pem).map_err(|e| TlsError::InvalidCsr(e.to_string()))
}

fn der_to_pem(label: &str, der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut pem = format!("-----BEGIN {}-----\n", label);
    for line in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {}-----\n", label));
    pem
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TlsManager {
        TlsManager::new("Test Mesh", "mesh.test", vec!["localhost".into()]).unwrap()
    }

    #[test]
    fn test_root_ca_is_pem() {
        let tls = manager();
        let root = String::from_utf8(tls.root_ca_pem().unwrap()).unwrap();
        assert!(root.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(!tls.coordinator_cert_pem().unwrap().is_empty());
    }

    #[test]
    fn test_issue_certificate_generates_key() {
        let tls = manager();
        let id = tls.issue_certificate("backend", "instance-1", None).unwrap();

        assert!(String::from_utf8_lossy(&id.certificate).contains("BEGIN CERTIFICATE"));
        let key = id.private_key.expect("generated key");
        assert!(String::from_utf8_lossy(&key).contains("PRIVATE KEY"));
        assert_eq!(id.root_ca, tls.root_ca_pem().unwrap());
        assert_eq!(tls.issued_count(), 1);
        assert_eq!(tls.issued_certificate("instance-1").unwrap(), id.certificate);
    }

    #[test]
    fn test_issue_certificate_from_csr() {
        let tls = manager();
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let csr = CertificateParams::new(vec!["backend".to_string()])
            .unwrap()
            .serialize_request(&key)
            .unwrap()
            .pem()
            .unwrap();

        let id = tls
            .issue_certificate("backend", "instance-2", Some(csr.as_bytes()))
            .unwrap();
        assert!(id.private_key.is_none());
        assert!(!id.certificate.is_empty());
    }

    #[test]
    fn test_invalid_csr_rejected() {
        let tls = manager();
        let err = tls
            .issue_certificate("backend", "instance-3", Some(b"garbage"))
            .err()
            .unwrap();
        assert!(matches!(err, TlsError::InvalidCsr(_)));
        assert_eq!(tls.issued_count(), 0);
    }

    #[test]
    fn test_revoke_forgets_instance() {
        let tls = manager();
        tls.issue_certificate("backend", "i", None).unwrap();
        assert!(tls.revoke("i"));
        assert!(!tls.revoke("i"));
        assert_eq!(tls.issued_count(), 0);
    }

    #[test]
    fn test_export_restore_keeps_root() {
        let tls = manager();
        let (cert, key) = tls.export_ca().unwrap();

        let other = manager();
        other.restore_ca(&cert, &key).unwrap();
        assert_eq!(other.root_ca_pem().unwrap(), tls.root_ca_pem().unwrap());
        assert!(other.issue_certificate("svc", "x", None).is_ok());
    }

    #[test]
    fn test_zero_drops_ca() {
        let tls = manager();
        tls.issue_certificate("backend", "i", None).unwrap();
        tls.zero();

        assert_eq!(tls.issued_count(), 0);
        assert!(matches!(tls.root_ca_pem(), Err(TlsError::Zeroed)));
        assert!(matches!(
            tls.issue_certificate("backend", "j", None),
            Err(TlsError::Zeroed)
        ));
    }

    #[test]
    fn test_policy_round_trip() {
        let tls = manager();
        let mut policy = TlsConfig::default();
        policy.incoming.insert("web".into(), vec![]);
        tls.initialize(&policy);
        assert_eq!(tls.policy(), policy);
    }
}
