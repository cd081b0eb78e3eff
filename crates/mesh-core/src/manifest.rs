//! Manifest model
//!
//! The manifest is the declarative policy a coordinator enforces: which
//! software packages may join the mesh, which marble types run them, which
//! secrets exist and who receives them, and who may recover the coordinator.
//!
//! All collections are ordered maps so the canonical JSON form, and with it
//! the fingerprint, depends only on content. Unknown fields are rejected
//! rather than dropped, so every field an operator writes is fingerprinted.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ManifestError, Result};
use crate::template;

/// Largest symmetric key a manifest may request
pub const MAX_SYMMETRIC_BITS: u32 = 4096;

/// Complete service-mesh policy document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Manifest {
    /// Attestation policy per package name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub packages: BTreeMap<String, Package>,

    /// Marble type definitions
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub marbles: BTreeMap<String, Marble>,

    /// Secret definitions
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, Secret>,

    /// Authorized operators
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub users: BTreeMap<String, User>,

    /// Permission roles referenced by users
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub roles: BTreeMap<String, Role>,

    /// Recovery holders: name -> RSA public key PEM
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub recovery_keys: BTreeMap<String, String>,

    /// Mesh-wide TLS policy
    #[serde(rename = "TLS", default, skip_serializing_if = "TlsConfig::is_empty")]
    pub tls: TlsConfig,
}

/// Expected identity of an enclave binary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Package {
    #[serde(rename = "UniqueID", default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    #[serde(rename = "SignerID", default, skip_serializing_if = "Option::is_none")]
    pub signer_id: Option<String>,

    #[serde(rename = "ProductID", default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u16>,

    #[serde(rename = "SecurityVersion", default, skip_serializing_if = "Option::is_none")]
    pub security_version: Option<u16>,

    /// Debug packages bypass quote verification
    #[serde(rename = "Debug", default, skip_serializing_if = "is_false")]
    pub debug: bool,

    #[serde(rename = "AcceptedTCBStatuses", default, skip_serializing_if = "Vec::is_empty")]
    pub accepted_tcb_statuses: Vec<String>,
}

/// A marble type admitted under a package policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Marble {
    pub package: String,

    #[serde(default, skip_serializing_if = "MarbleParameters::is_empty")]
    pub parameters: MarbleParameters,

    #[serde(rename = "TLS", default, skip_serializing_if = "MarbleTls::is_empty")]
    pub tls: MarbleTls,

    /// Maximum concurrently active instances; 0 means unlimited
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_activations: u32,
}

/// Templates rendered for each activated instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct MarbleParameters {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub argv: Vec<String>,
}

/// Per-marble TLS endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct MarbleTls {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub incoming: Vec<TlsEndpoint>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outgoing: Vec<TlsEndpoint>,
}

/// A TLS endpoint declared by a marble or by mesh policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct TlsEndpoint {
    pub port: String,

    /// Name of the certificate secret served on this endpoint
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cert: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_marbles: Vec<String>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub disable_client_auth: bool,
}

/// Mesh-wide TLS policy: tag -> endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct TlsConfig {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub incoming: BTreeMap<String, Vec<TlsEndpoint>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outgoing: BTreeMap<String, Vec<TlsEndpoint>>,
}

/// Kinds of secrets the coordinator can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecretType {
    #[serde(rename = "symmetric-key")]
    SymmetricKey,
    #[serde(rename = "cert-ecdsa")]
    CertEcdsa,
    #[serde(rename = "cert-rsa")]
    CertRsa,
    #[serde(rename = "cert-ed25519")]
    CertEd25519,
    #[serde(rename = "plain")]
    Plain,
}

impl SecretType {
    /// Whether secrets of this type carry a certificate
    pub fn is_certificate(&self) -> bool {
        matches!(
            self,
            SecretType::CertEcdsa | SecretType::CertRsa | SecretType::CertEd25519
        )
    }

    /// Manifest spelling of the type
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretType::SymmetricKey => "symmetric-key",
            SecretType::CertEcdsa => "cert-ecdsa",
            SecretType::CertRsa => "cert-rsa",
            SecretType::CertEd25519 => "cert-ed25519",
            SecretType::Plain => "plain",
        }
    }
}

impl std::fmt::Display for SecretType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Secret {
    #[serde(rename = "Type")]
    pub secret_type: SecretType,

    /// Key size in bits; 0 selects the type's default
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: u32,

    #[serde(default, skip_serializing_if = "is_false")]
    pub shared: bool,

    /// Value is supplied by an operator instead of generated
    #[serde(default, skip_serializing_if = "is_false")]
    pub user_defined: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<CertConfig>,

    /// Preset private value of a user-defined secret
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub private: String,

    /// Preset public key, or certificate for certificate types, of a
    /// user-defined secret
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public: String,
}

impl Secret {
    /// A generated symmetric key of `bits` bits
    pub fn symmetric(bits: u32) -> Self {
        Self {
            secret_type: SecretType::SymmetricKey,
            size: bits,
            shared: false,
            user_defined: false,
            cert: None,
            private: String::new(),
            public: String::new(),
        }
    }

    /// A generated certificate secret of the given type
    pub fn certificate(secret_type: SecretType, cert: Option<CertConfig>) -> Self {
        Self {
            secret_type,
            size: 0,
            shared: false,
            user_defined: false,
            cert,
            private: String::new(),
            public: String::new(),
        }
    }

    /// An operator-supplied plain value
    pub fn user_plain() -> Self {
        Self {
            secret_type: SecretType::Plain,
            size: 0,
            shared: false,
            user_defined: true,
            cert: None,
            private: String::new(),
            public: String::new(),
        }
    }
}

/// Certificate parameters for certificate secrets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertConfig {
    #[serde(rename = "Subject", default, skip_serializing_if = "CertSubject::is_empty")]
    pub subject: CertSubject,

    #[serde(rename = "DNSNames", default, skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,

    #[serde(rename = "IPAddresses", default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,

    /// Validity in days; 0 selects 365
    #[serde(rename = "ValidityDays", default, skip_serializing_if = "is_zero")]
    pub validity_days: u32,

    #[serde(rename = "IsCA", default, skip_serializing_if = "is_false")]
    pub is_ca: bool,

    /// Name of the CA certificate secret that signs this one; self-signed when empty
    #[serde(rename = "SignedBy", default, skip_serializing_if = "String::is_empty")]
    pub signed_by: String,
}

/// Distinguished name fields of a certificate subject
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct CertSubject {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub common_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organization: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub country: Vec<String>,
}

/// An authorized operator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct User {
    pub certificate: String,

    #[serde(default)]
    pub roles: Vec<String>,
}

/// A permission role
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Role {
    pub resource_type: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_names: Vec<String>,

    pub actions: Vec<String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl MarbleParameters {
    fn is_empty(&self) -> bool {
        self.env.is_empty() && self.files.is_empty() && self.argv.is_empty()
    }
}

impl MarbleTls {
    fn is_empty(&self) -> bool {
        self.incoming.is_empty() && self.outgoing.is_empty()
    }

    fn endpoints(&self) -> impl Iterator<Item = &TlsEndpoint> {
        self.incoming.iter().chain(self.outgoing.iter())
    }
}

impl TlsConfig {
    /// Whether no mesh-wide policy is declared
    pub fn is_empty(&self) -> bool {
        self.incoming.is_empty() && self.outgoing.is_empty()
    }

    /// Every endpoint of every tag, with its tag
    pub fn endpoints(&self) -> impl Iterator<Item = (&str, &TlsEndpoint)> {
        self.incoming
            .iter()
            .chain(self.outgoing.iter())
            .flat_map(|(tag, eps)| eps.iter().map(move |ep| (tag.as_str(), ep)))
    }
}

impl CertSubject {
    fn is_empty(&self) -> bool {
        self.common_name.is_empty() && self.organization.is_empty() && self.country.is_empty()
    }
}

impl Marble {
    /// Whether activation must issue a mesh TLS identity
    pub fn requires_tls(&self) -> bool {
        !self.tls.is_empty()
    }
}

impl Manifest {
    /// Decode a manifest from JSON
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Canonical JSON serialization
    ///
    /// Ordered maps and omitted defaults make this byte-identical for
    /// manifests with identical content.
    pub fn to_canonical_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ManifestError::Serialization(e.to_string()))
    }

    /// Lowercase hex SHA-256 of the canonical JSON
    pub fn fingerprint(&self) -> Result<String> {
        let canonical = self.to_canonical_json()?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }

    /// Names of every secret the marble type is entitled to, sorted
    ///
    /// Collected from TLS endpoint certificates and from placeholders in the
    /// marble's environment and file templates. Unknown marble types yield
    /// an empty list.
    pub fn marble_secrets(&self, marble_type: &str) -> Vec<String> {
        let Some(marble) = self.marbles.get(marble_type) else {
            return Vec::new();
        };

        let mut names = BTreeSet::new();
        for ep in marble.tls.endpoints() {
            if !ep.cert.is_empty() {
                names.insert(ep.cert.clone());
            }
        }
        let templates = marble
            .parameters
            .env
            .values()
            .chain(marble.parameters.files.values());
        for tpl in templates {
            for secret_ref in template::references(tpl) {
                names.insert(secret_ref.name);
            }
        }
        names.into_iter().collect()
    }

    /// Validate cross references and per-entry rules
    ///
    /// All violations are collected and reported together.
    pub fn validate(&self) -> Result<()> {
        let mut errs = Vec::new();

        for (name, pkg) in &self.packages {
            let has_identity = pkg.unique_id.as_deref().is_some_and(|s| !s.is_empty())
                || pkg.signer_id.as_deref().is_some_and(|s| !s.is_empty());
            if !pkg.debug && !has_identity {
                errs.push(format!(
                    "package '{}': UniqueID or SignerID required (or Debug=true)",
                    name
                ));
            }
        }

        for (name, secret) in &self.secrets {
            if let Err(msg) = validate_secret(secret) {
                errs.push(format!("secret '{}': {}", name, msg));
            }
            if let Err(msg) = self.check_signer(name, secret) {
                errs.push(format!("secret '{}': {}", name, msg));
            }
        }

        for (name, marble) in &self.marbles {
            if marble.package.is_empty() {
                errs.push(format!("marble '{}': Package is required", name));
            } else if !self.packages.contains_key(&marble.package) {
                errs.push(format!("marble '{}': unknown package '{}'", name, marble.package));
            }

            for secret in self.marble_secrets(name) {
                if !self.secrets.contains_key(&secret) {
                    errs.push(format!("marble '{}': references unknown secret '{}'", name, secret));
                }
            }

            for ep in marble.tls.endpoints() {
                self.check_endpoint(&format!("marble '{}'", name), ep, &mut errs);
            }
        }

        for (tag, ep) in self.tls.endpoints() {
            self.check_endpoint(&format!("TLS tag '{}'", tag), ep, &mut errs);
        }

        for (holder, pem) in &self.recovery_keys {
            if pem.trim().is_empty() {
                errs.push(format!("recovery key '{}': public key is empty", holder));
            }
        }

        for (name, user) in &self.users {
            for role in &user.roles {
                if !self.roles.contains_key(role) {
                    errs.push(format!("user '{}': unknown role '{}'", name, role));
                }
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(ManifestError::Invalid(errs))
        }
    }

    /// Issuer certificate secret of `secret`, if it names one
    pub fn signer_of<'a>(&self, secret: &'a Secret) -> Option<&'a str> {
        secret
            .cert
            .as_ref()
            .map(|c| c.signed_by.as_str())
            .filter(|s| !s.is_empty())
    }

    fn check_signer(&self, name: &str, secret: &Secret) -> std::result::Result<(), String> {
        let Some(mut signer) = self.signer_of(secret) else {
            return Ok(());
        };
        if secret.user_defined {
            return Err("SignedBy given for a user-defined secret".into());
        }
        // Walk the issuer chain; it must end at a self-signed CA
        for _ in 0..self.secrets.len() {
            if signer == name {
                return Err(format!("SignedBy chain through '{}' is circular", signer));
            }
            let Some(issuer) = self.secrets.get(signer) else {
                return Err(format!("SignedBy references unknown secret '{}'", signer));
            };
            let is_ca = issuer.cert.as_ref().is_some_and(|c| c.is_ca);
            if !issuer.secret_type.is_certificate() || issuer.user_defined || !is_ca {
                return Err(format!("SignedBy secret '{}' is not a generated CA certificate", signer));
            }
            match self.signer_of(issuer) {
                Some(next) => signer = next,
                None => return Ok(()),
            }
        }
        Err(format!("SignedBy chain through '{}' is circular", signer))
    }

    fn check_endpoint(&self, owner: &str, ep: &TlsEndpoint, errs: &mut Vec<String>) {
        if !ep.cert.is_empty() {
            match self.secrets.get(&ep.cert) {
                Some(secret) if !secret.secret_type.is_certificate() => errs.push(format!(
                    "{}: endpoint '{}' uses non-certificate secret '{}'",
                    owner, ep.port, ep.cert
                )),
                Some(_) => {}
                None => errs.push(format!(
                    "{}: endpoint '{}' uses unknown secret '{}'",
                    owner, ep.port, ep.cert
                )),
            }
        }
        for allowed in &ep.allowed_marbles {
            if !self.marbles.contains_key(allowed) {
                errs.push(format!(
                    "{}: endpoint '{}' allows unknown marble '{}'",
                    owner, ep.port, allowed
                ));
            }
        }
    }
}

fn validate_secret(secret: &Secret) -> std::result::Result<(), String> {
    match secret.secret_type {
        SecretType::SymmetricKey => {
            if secret.size % 8 != 0 {
                return Err(format!("Size {} is not a multiple of 8", secret.size));
            }
            if secret.size > MAX_SYMMETRIC_BITS {
                return Err(format!("Size {} exceeds {} bits", secret.size, MAX_SYMMETRIC_BITS));
            }
        }
        SecretType::CertRsa => {
            if secret.size != 0 && !(2048..=4096).contains(&secret.size) {
                return Err(format!("RSA Size {} outside 2048..=4096", secret.size));
            }
        }
        SecretType::Plain => {
            if !secret.user_defined {
                return Err("plain secrets must be UserDefined".into());
            }
        }
        SecretType::CertEcdsa | SecretType::CertEd25519 => {}
    }
    if secret.cert.is_some() && !secret.secret_type.is_certificate() {
        return Err("Cert parameters given for a non-certificate secret".into());
    }
    if !secret.user_defined && !(secret.private.is_empty() && secret.public.is_empty()) {
        return Err("Private and Public may only preset UserDefined secrets".into());
    }
    Ok(())
}
