//! # Mesh Core
//!
//! Policy types shared by the confidential mesh coordinator and its clients.
//!
//! ## Key Concepts
//!
//! - **Manifest**: declarative policy naming packages, marble types, secrets,
//!   TLS rules and recovery holders
//! - **Marble**: a service-instance type admitted into the mesh
//! - **Package**: the identity a marble's binary must attest to
//! - **Quote**: attestation evidence checked against a package before admission
//!
//! Nothing in this crate performs I/O or holds secret material; the
//! coordinator crate owns all state.

pub mod attestation;
pub mod error;
pub mod manifest;
pub mod template;

pub use attestation::{PolicyViolation, QuoteReport};
pub use error::{ManifestError, Result, TemplateError};
pub use manifest::{
    CertConfig, CertSubject, Manifest, Marble, MarbleParameters, MarbleTls, Package, Role, Secret,
    SecretType, TlsConfig, TlsEndpoint, User, MAX_SYMMETRIC_BITS,
};
pub use template::{SecretField, SecretLookup, SecretRef};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
