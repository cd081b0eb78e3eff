//! Secret Manager
//!
//! Holds every secret the coordinator hands out:
//! - Generated secrets, created from their manifest definition
//! - User-defined secrets, supplied by an operator after the manifest is set
//! - The sealing key that protects persisted state
//!
//! All secret bytes live in `Zeroizing` buffers so they are wiped when
//! replaced, removed or dropped.

use mesh_core::{CertConfig, Manifest, Secret, SecretField, SecretLookup, SecretType, TemplateError};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use thiserror::Error;
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::{set_validity, SerialSource};

/// Length of the sealing key in bytes (AES-256)
pub const SEALING_KEY_LEN: usize = 32;

const DEFAULT_SYMMETRIC_BITS: u32 = 256;
const DEFAULT_RSA_BITS: u32 = 2048;
const DEFAULT_CERT_VALIDITY_DAYS: u32 = 365;

/// Errors from the secret manager
#[derive(Error, Debug)]
pub enum SecretError {
    #[error("Secret not found: {0}")]
    NotFound(String),

    #[error("Secret '{0}' is not user-defined")]
    NotUserDefined(String),

    #[error("Failed to generate secret '{name}': {reason}")]
    Generation { name: String, reason: String },

    #[error("Entropy source failed: {0}")]
    Entropy(String),

    #[error("Invalid sealing key length: expected {SEALING_KEY_LEN}, got {0}")]
    InvalidSealingKey(usize),
}

impl SecretError {
    fn generation(name: &str, reason: impl ToString) -> Self {
        SecretError::Generation {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Material of one generated secret
///
/// Symmetric keys only fill `private`. Certificate secrets hold the PEM
/// private key, PEM public key and PEM certificate.
#[derive(Clone)]
pub struct GeneratedSecret {
    pub secret_type: SecretType,
    pub private: Zeroizing<Vec<u8>>,
    pub public: Vec<u8>,
    pub cert: Vec<u8>,
}

impl std::fmt::Debug for GeneratedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedSecret")
            .field("secret_type", &self.secret_type)
            .field("private", &"[REDACTED]")
            .field("public_len", &self.public.len())
            .field("cert_len", &self.cert.len())
            .finish()
    }
}

/// Fields of one secret as seen by template rendering
#[derive(Clone, Default)]
pub struct SecretMaterial {
    pub private: Zeroizing<Vec<u8>>,
    pub public: Vec<u8>,
    pub cert: Vec<u8>,
}

/// Named secret material for rendering one marble's templates
#[derive(Clone, Default)]
pub struct SecretBundle(pub BTreeMap<String, SecretMaterial>);

impl SecretLookup for SecretBundle {
    fn secret(&self, name: &str, field: SecretField) -> Result<&[u8], TemplateError> {
        let material = self.0.get(name).ok_or_else(|| TemplateError::MissingSecret {
            name: name.to_string(),
        })?;
        let bytes: &[u8] = match field {
            SecretField::Private => &material.private,
            SecretField::Public => &material.public,
            SecretField::Cert => &material.cert,
        };
        if bytes.is_empty() && field != SecretField::Private {
            return Err(TemplateError::MissingField {
                name: name.to_string(),
                field: field.as_str().to_string(),
            });
        }
        Ok(bytes)
    }
}

/// Secrets generated for a manifest but not yet installed
///
/// Produced by [`SecretManager::stage`] so a manifest is only committed once
/// every secret generated successfully.
#[derive(Debug, Default)]
pub struct StagedSecrets {
    secrets: HashMap<String, GeneratedSecret>,
}

impl StagedSecrets {
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

/// Serializable form of one secret inside sealed state
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SnapshotSecret {
    pub name: String,
    #[zeroize(skip)]
    pub secret_type: Option<SecretType>,
    pub private: Vec<u8>,
    #[serde(default)]
    pub public: Vec<u8>,
    #[serde(default)]
    pub cert: Vec<u8>,
}

/// Serializable form of every secret inside sealed state
#[derive(Serialize, Deserialize, Default)]
pub struct SecretsSnapshot {
    pub generated: Vec<SnapshotSecret>,
    pub user_defined: Vec<SnapshotSecret>,
}

#[derive(Default)]
struct SecretStore {
    generated: HashMap<String, GeneratedSecret>,
    user_defined: HashMap<String, Zeroizing<Vec<u8>>>,
}

/// Secret Manager
pub struct SecretManager {
    sealing_key: RwLock<Zeroizing<Vec<u8>>>,
    store: RwLock<SecretStore>,
    serials: SerialSource,
}

impl SecretManager {
    /// Create a manager with a fresh random sealing key
    pub fn new() -> Result<Self, SecretError> {
        let mut key = Zeroizing::new(vec![0u8; SEALING_KEY_LEN]);
        OsRng
            .try_fill_bytes(&mut key)
            .map_err(|e| SecretError::Entropy(e.to_string()))?;

        info!("Secret manager initialized with fresh sealing key");

        Ok(Self {
            sealing_key: RwLock::new(key),
            store: RwLock::new(SecretStore::default()),
            serials: SerialSource::default(),
        })
    }

    // =========================================================================
    // Generation
    // =========================================================================

    /// Generate material for one secret definition
    ///
    /// User-defined secrets yield their preset `Private`/`Public` values, or
    /// `None` when the manifest presets nothing.
    pub fn generate(&self, name: &str, def: &Secret) -> Result<Option<GeneratedSecret>, SecretError> {
        self.generate_with_issuer(name, def, None)
    }

    fn generate_with_issuer(
        &self,
        name: &str,
        def: &Secret,
        issuer: Option<&GeneratedSecret>,
    ) -> Result<Option<GeneratedSecret>, SecretError> {
        if def.user_defined {
            return Ok(preset(def));
        }

        let generated = match def.secret_type {
            SecretType::SymmetricKey => {
                let bits = if def.size == 0 { DEFAULT_SYMMETRIC_BITS } else { def.size };
                let mut key = Zeroizing::new(vec![0u8; (bits / 8) as usize]);
                OsRng
                    .try_fill_bytes(&mut key)
                    .map_err(|e| SecretError::Entropy(e.to_string()))?;
                GeneratedSecret {
                    secret_type: SecretType::SymmetricKey,
                    private: key,
                    public: Vec::new(),
                    cert: Vec::new(),
                }
            }
            SecretType::CertEcdsa | SecretType::CertRsa | SecretType::CertEd25519 => {
                self.generate_certificate(name, def, issuer)?
            }
            SecretType::Plain => {
                return Err(SecretError::generation(name, "plain secrets must be user-defined"));
            }
        };

        debug!(name = %name, secret_type = %def.secret_type, "Generated secret");
        Ok(Some(generated))
    }

    fn generate_certificate(
        &self,
        name: &str,
        def: &Secret,
        issuer: Option<&GeneratedSecret>,
    ) -> Result<GeneratedSecret, SecretError> {
        let (key_pair, private_pem) = match def.secret_type {
            SecretType::CertEcdsa => {
                let kp = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
                    .map_err(|e| SecretError::generation(name, e))?;
                let pem = Zeroizing::new(kp.serialize_pem());
                (kp, pem)
            }
            SecretType::CertEd25519 => {
                let kp = KeyPair::generate_for(&rcgen::PKCS_ED25519)
                    .map_err(|e| SecretError::generation(name, e))?;
                let pem = Zeroizing::new(kp.serialize_pem());
                (kp, pem)
            }
            SecretType::CertRsa => {
                let bits = if def.size == 0 { DEFAULT_RSA_BITS } else { def.size };
                let rsa_key = rsa::RsaPrivateKey::new(&mut OsRng, bits as usize)
                    .map_err(|e| SecretError::generation(name, e))?;
                let pem = rsa_key
                    .to_pkcs8_pem(LineEnding::LF)
                    .map_err(|e| SecretError::generation(name, e))?;
                let pem = Zeroizing::new(pem.to_string());
                let kp = KeyPair::from_pem_and_sign_algo(&pem, &rcgen::PKCS_RSA_SHA256)
                    .map_err(|e| SecretError::generation(name, e))?;
                (kp, pem)
            }
            other => {
                return Err(SecretError::generation(name, format!("{} is not a certificate type", other)));
            }
        };

        let cfg = def.cert.clone().unwrap_or_default();
        let params = self
            .certificate_params(name, &cfg)
            .map_err(|e| SecretError::generation(name, e))?;
        let cert = match issuer {
            Some(issuer) => {
                let (issuer_cert, issuer_key) =
                    issuer_parts(issuer).map_err(|e| SecretError::generation(name, e))?;
                params.signed_by(&key_pair, &issuer_cert, &issuer_key)
            }
            None => params.self_signed(&key_pair),
        }
        .map_err(|e| SecretError::generation(name, e))?;

        Ok(GeneratedSecret {
            secret_type: def.secret_type,
            private: Zeroizing::new(private_pem.as_bytes().to_vec()),
            public: key_pair.public_key_pem().into_bytes(),
            cert: cert.pem().into_bytes(),
        })
    }

    fn certificate_params(&self, name: &str, cfg: &CertConfig) -> Result<CertificateParams, String> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        let cn = if cfg.subject.common_name.is_empty() {
            name
        } else {
            cfg.subject.common_name.as_str()
        };
        dn.push(DnType::CommonName, cn);
        if let Some(org) = cfg.subject.organization.first() {
            dn.push(DnType::OrganizationName, org.as_str());
        }
        if let Some(country) = cfg.subject.country.first() {
            dn.push(DnType::CountryName, country.as_str());
        }
        params.distinguished_name = dn;

        for dns in &cfg.dns_names {
            let dns = Ia5String::try_from(dns.clone()).map_err(|e| format!("DNS name '{}': {}", dns, e))?;
            params.subject_alt_names.push(SanType::DnsName(dns));
        }
        for ip in &cfg.ip_addresses {
            let addr: IpAddr = ip
                .parse()
                .map_err(|e| format!("IP address '{}': {}", ip, e))?;
            params.subject_alt_names.push(SanType::IpAddress(addr));
        }

        let days = if cfg.validity_days == 0 {
            DEFAULT_CERT_VALIDITY_DAYS
        } else {
            cfg.validity_days
        };
        set_validity(&mut params, days);
        params.serial_number = Some(self.serials.next());

        if cfg.is_ca {
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
            ];
        } else {
            params.key_usages = vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ];
            params.extended_key_usages = vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ];
        }

        Ok(params)
    }

    /// Generate and install one secret, replacing any previous value
    ///
    /// A certificate with `SignedBy` is issued by that already installed
    /// secret.
    pub fn generate_secret(&self, name: &str, def: &Secret) -> Result<(), SecretError> {
        let issuer = match issuer_name(def) {
            Some(issuer) => Some(
                self.store
                    .read()
                    .generated
                    .get(issuer)
                    .cloned()
                    .ok_or_else(|| SecretError::generation(name, format!("issuer '{}' not found", issuer)))?,
            ),
            None => None,
        };
        if let Some(generated) = self.generate_with_issuer(name, def, issuer.as_ref())? {
            self.store.write().generated.insert(name.to_string(), generated);
        }
        Ok(())
    }

    /// Generate every secret of a manifest without installing any
    ///
    /// Issuers are generated before the certificates they sign.
    pub fn stage(&self, manifest: &Manifest) -> Result<StagedSecrets, SecretError> {
        let mut staged = StagedSecrets::default();
        let mut pending: Vec<(&String, &Secret)> = manifest.secrets.iter().collect();

        while !pending.is_empty() {
            let before = pending.len();
            let mut deferred = Vec::new();
            for (name, def) in pending {
                let issuer = match issuer_name(def) {
                    Some(issuer) => match staged.secrets.get(issuer) {
                        Some(generated) => Some(generated),
                        None => {
                            deferred.push((name, def));
                            continue;
                        }
                    },
                    None => None,
                };
                if let Some(generated) = self.generate_with_issuer(name, def, issuer)? {
                    staged.secrets.insert(name.clone(), generated);
                }
            }
            if let Some((name, def)) = deferred.first().filter(|_| deferred.len() == before) {
                let issuer = issuer_name(def).unwrap_or_default();
                return Err(SecretError::generation(
                    name,
                    format!("issuer '{}' cannot be generated", issuer),
                ));
            }
            pending = deferred;
        }
        Ok(staged)
    }

    /// Install staged secrets
    pub fn commit(&self, staged: StagedSecrets) {
        let count = staged.len();
        let mut store = self.store.write();
        store.generated.extend(staged.secrets);
        info!(count = count, "Generated secrets installed");
    }

    // =========================================================================
    // Access
    // =========================================================================

    /// Primary value of a secret
    ///
    /// User-defined values take precedence, then the private part of a
    /// generated secret.
    pub fn get_secret(&self, name: &str) -> Result<Zeroizing<Vec<u8>>, SecretError> {
        let store = self.store.read();
        if let Some(value) = store.user_defined.get(name) {
            return Ok(value.clone());
        }
        if let Some(generated) = store.generated.get(name) {
            return Ok(generated.private.clone());
        }
        Err(SecretError::NotFound(name.to_string()))
    }

    /// Every field of a secret, for template rendering
    pub fn material(&self, name: &str) -> Result<SecretMaterial, SecretError> {
        let store = self.store.read();
        if let Some(value) = store.user_defined.get(name) {
            return Ok(SecretMaterial {
                private: value.clone(),
                ..Default::default()
            });
        }
        match store.generated.get(name) {
            Some(g) => Ok(SecretMaterial {
                private: g.private.clone(),
                public: g.public.clone(),
                cert: g.cert.clone(),
            }),
            None => Err(SecretError::NotFound(name.to_string())),
        }
    }

    /// Store an operator-supplied value, wiping any previous one
    pub fn set_user_secret(&self, name: &str, value: &[u8]) {
        let mut store = self.store.write();
        store
            .user_defined
            .insert(name.to_string(), Zeroizing::new(value.to_vec()));
        info!(name = %name, "User-defined secret set");
    }

    /// Store several operator-supplied values at once
    ///
    /// Returns the values they replaced, for [`SecretManager::revert_user_secrets`].
    pub fn replace_user_secrets(
        &self,
        values: &BTreeMap<String, Vec<u8>>,
    ) -> BTreeMap<String, Option<Zeroizing<Vec<u8>>>> {
        let mut store = self.store.write();
        values
            .iter()
            .map(|(name, value)| {
                let old = store
                    .user_defined
                    .insert(name.clone(), Zeroizing::new(value.clone()));
                (name.clone(), old)
            })
            .collect()
    }

    /// Put back values displaced by [`SecretManager::replace_user_secrets`]
    pub fn revert_user_secrets(&self, previous: BTreeMap<String, Option<Zeroizing<Vec<u8>>>>) {
        let mut store = self.store.write();
        for (name, old) in previous {
            match old {
                Some(value) => store.user_defined.insert(name, value),
                None => store.user_defined.remove(&name),
            };
        }
    }

    /// Whether a secret has a value of either kind
    pub fn has_secret(&self, name: &str) -> bool {
        let store = self.store.read();
        store.user_defined.contains_key(name) || store.generated.contains_key(name)
    }

    /// Copy of the sealing key
    pub fn sealing_key(&self) -> Zeroizing<Vec<u8>> {
        self.sealing_key.read().clone()
    }

    /// Replace the sealing key, e.g. with one recovered from key holders
    pub fn set_sealing_key(&self, key: &[u8]) -> Result<(), SecretError> {
        if key.len() != SEALING_KEY_LEN {
            return Err(SecretError::InvalidSealingKey(key.len()));
        }
        *self.sealing_key.write() = Zeroizing::new(key.to_vec());
        Ok(())
    }

    // =========================================================================
    // Sealed state
    // =========================================================================

    /// Copy every secret into its sealed-state form
    pub fn snapshot(&self) -> SecretsSnapshot {
        let store = self.store.read();
        let mut generated: Vec<_> = store
            .generated
            .iter()
            .map(|(name, g)| SnapshotSecret {
                name: name.clone(),
                secret_type: Some(g.secret_type),
                private: g.private.to_vec(),
                public: g.public.clone(),
                cert: g.cert.clone(),
            })
            .collect();
        generated.sort_by(|a, b| a.name.cmp(&b.name));

        let mut user_defined: Vec<_> = store
            .user_defined
            .iter()
            .map(|(name, value)| SnapshotSecret {
                name: name.clone(),
                secret_type: None,
                private: value.to_vec(),
                public: Vec::new(),
                cert: Vec::new(),
            })
            .collect();
        user_defined.sort_by(|a, b| a.name.cmp(&b.name));

        SecretsSnapshot {
            generated,
            user_defined,
        }
    }

    /// Replace every secret with the contents of a snapshot
    pub fn restore(&self, snapshot: &SecretsSnapshot) {
        let mut store = self.store.write();
        store.generated.clear();
        store.user_defined.clear();

        for s in &snapshot.generated {
            store.generated.insert(
                s.name.clone(),
                GeneratedSecret {
                    secret_type: s.secret_type.unwrap_or(SecretType::SymmetricKey),
                    private: Zeroizing::new(s.private.clone()),
                    public: s.public.clone(),
                    cert: s.cert.clone(),
                },
            );
        }
        for s in &snapshot.user_defined {
            store
                .user_defined
                .insert(s.name.clone(), Zeroizing::new(s.private.clone()));
        }

        info!(
            generated = store.generated.len(),
            user_defined = store.user_defined.len(),
            "Secrets restored from sealed state"
        );
    }

    /// Wipe every secret and the sealing key
    pub fn zero(&self) {
        let mut store = self.store.write();
        for secret in store.generated.values_mut() {
            secret.private.zeroize();
        }
        for value in store.user_defined.values_mut() {
            value.zeroize();
        }
        store.generated.clear();
        store.user_defined.clear();
        self.sealing_key.write().zeroize();
        info!("Secret manager zeroed");
    }
}

fn issuer_name(def: &Secret) -> Option<&str> {
    def.cert
        .as_ref()
        .map(|c| c.signed_by.as_str())
        .filter(|s| !s.is_empty())
}

/// Material preset in the manifest for a user-defined secret
fn preset(def: &Secret) -> Option<GeneratedSecret> {
    if def.private.is_empty() && def.public.is_empty() {
        return None;
    }
    let public = def.public.as_bytes().to_vec();
    let (public, cert) = if def.secret_type.is_certificate() {
        (Vec::new(), public)
    } else {
        (public, Vec::new())
    };
    Some(GeneratedSecret {
        secret_type: def.secret_type,
        private: Zeroizing::new(def.private.as_bytes().to_vec()),
        public,
        cert,
    })
}

/// Certificate and key of a CA secret, ready to sign with
fn issuer_parts(issuer: &GeneratedSecret) -> Result<(Certificate, KeyPair), String> {
    let key_pem = std::str::from_utf8(&issuer.private).map_err(|e| format!("issuer key: {}", e))?;
    let key = match issuer.secret_type {
        SecretType::CertRsa => KeyPair::from_pem_and_sign_algo(key_pem, &rcgen::PKCS_RSA_SHA256),
        _ => KeyPair::from_pem(key_pem),
    }
    .map_err(|e| format!("issuer key: {}", e))?;
    let cert_pem = std::str::from_utf8(&issuer.cert).map_err(|e| format!("issuer certificate: {}", e))?;
    let cert = CertificateParams::from_ca_cert_pem(cert_pem)
        .and_then(|params| params.self_signed(&key))
        .map_err(|e| format!("issuer certificate: {}", e))?;
    Ok((cert, key))
}
