//! Coordinator configuration
//!
//! Everything is read from `COORDINATOR_*` environment variables. Parsing
//! goes through a lookup function so tests can supply a map instead of the
//! process environment.

use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use zeroize::Zeroizing;

/// Configuration errors, reported before the coordinator starts
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid value for {var}: {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub reason: String,
}

impl ConfigError {
    fn new(var: &'static str, reason: impl Into<String>) -> Self {
        Self {
            var,
            reason: reason.into(),
        }
    }
}

/// How coordinator state is sealed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SealMode {
    /// Seal for any instance of the same product
    #[default]
    ProductKey,
    /// Seal for this instance only
    UniqueKey,
    /// Never persist state
    Disabled,
}

impl SealMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, SealMode::Disabled)
    }
}

impl FromStr for SealMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "productkey" | "product-key" | "" => Ok(SealMode::ProductKey),
            "uniquekey" | "unique-key" => Ok(SealMode::UniqueKey),
            "disabled" | "disable" | "none" => Ok(SealMode::Disabled),
            other => Err(format!("unknown seal mode '{}'", other)),
        }
    }
}

/// Coordinator engine configuration
#[derive(Clone)]
pub struct CoordinatorConfig {
    pub seal_mode: SealMode,

    /// DNS names on the coordinator's own certificate
    pub dns_names: Vec<String>,

    /// Matching shares required to recover; at least 1
    pub recovery_threshold: usize,

    /// Skip quote verification and return simulated quotes
    pub simulation_mode: bool,

    /// Suffix of marble certificate SANs (`<marble>.<mesh_domain>`)
    pub mesh_domain: String,

    /// Subject organization of the mesh root CA
    pub organization: String,

    /// Key that wraps the sealing key so restarts unseal without recovery
    pub platform_seal_key: Option<Zeroizing<[u8; 32]>>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            seal_mode: SealMode::ProductKey,
            dns_names: vec!["localhost".into()],
            recovery_threshold: 1,
            simulation_mode: false,
            mesh_domain: "service-mesh.local".into(),
            organization: "Mesh".into(),
            platform_seal_key: None,
        }
    }
}

impl std::fmt::Debug for CoordinatorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorConfig")
            .field("seal_mode", &self.seal_mode)
            .field("dns_names", &self.dns_names)
            .field("recovery_threshold", &self.recovery_threshold)
            .field("simulation_mode", &self.simulation_mode)
            .field("mesh_domain", &self.mesh_domain)
            .field("organization", &self.organization)
            .field("platform_seal_key", &self.platform_seal_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl CoordinatorConfig {
    /// Read from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = lookup("COORDINATOR_SEAL_MODE") {
            config.seal_mode = v
                .parse()
                .map_err(|e: String| ConfigError::new("COORDINATOR_SEAL_MODE", e))?;
        }

        if let Some(v) = lookup("COORDINATOR_DNS_NAMES") {
            let names: Vec<String> = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if names.is_empty() {
                return Err(ConfigError::new("COORDINATOR_DNS_NAMES", "at least one name required"));
            }
            config.dns_names = names;
        }

        if let Some(v) = lookup("COORDINATOR_RECOVERY_THRESHOLD") {
            let threshold: usize = v
                .trim()
                .parse()
                .map_err(|e| ConfigError::new("COORDINATOR_RECOVERY_THRESHOLD", format!("{}", e)))?;
            if threshold == 0 {
                return Err(ConfigError::new("COORDINATOR_RECOVERY_THRESHOLD", "must be at least 1"));
            }
            config.recovery_threshold = threshold;
        }

        if let Some(v) = lookup("COORDINATOR_SIMULATION") {
            config.simulation_mode = parse_bool(&v)
                .ok_or_else(|| ConfigError::new("COORDINATOR_SIMULATION", format!("'{}' is not a boolean", v)))?;
        }

        if let Some(v) = lookup("COORDINATOR_MESH_DOMAIN") {
            let v = v.trim();
            if v.is_empty() {
                return Err(ConfigError::new("COORDINATOR_MESH_DOMAIN", "must not be empty"));
            }
            config.mesh_domain = v.to_string();
        }

        if let Some(v) = lookup("COORDINATOR_ORGANIZATION") {
            if !v.trim().is_empty() {
                config.organization = v.trim().to_string();
            }
        }

        if let Some(v) = lookup("COORDINATOR_SEAL_KEY") {
            let v = Zeroizing::new(v);
            let mut key = Zeroizing::new([0u8; 32]);
            hex::decode_to_slice(v.trim(), key.as_mut_slice())
                .map_err(|e| ConfigError::new("COORDINATOR_SEAL_KEY", format!("expected 64 hex chars: {}", e)))?;
            config.platform_seal_key = Some(key);
        }

        Ok(config)
    }
}

/// Settings of the HTTP server binary
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub log_level: String,
    /// Directory for file-backed sealed state; memory-backed when unset
    pub state_dir: Option<PathBuf>,
    pub coordinator: CoordinatorConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let port = match lookup("COORDINATOR_PORT") {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|e| ConfigError::new("COORDINATOR_PORT", format!("{}", e)))?,
            None => 8080,
        };
        let log_level = lookup("COORDINATOR_LOG_LEVEL").unwrap_or_else(|| "info".into());
        let state_dir = lookup("COORDINATOR_STATE_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            port,
            log_level,
            state_dir,
            coordinator: CoordinatorConfig::from_lookup(&lookup)?,
        })
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
