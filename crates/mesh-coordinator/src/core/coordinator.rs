//! Coordinator
//!
//! The lifecycle and admission state machine of the mesh. It composes the
//! four managers, enforces the manifest on every activation and persists
//! its state through a [`SealedStateStore`].
//!
//! ## Locking
//!
//! `inner` guards state, manifest, instance table and stats. It is held only
//! for bookkeeping, never across key generation, quote verification or
//! certificate issuance:
//!
//! 1. Activation reserves its instance id under the lock (this is where the
//!    activation limit and duplicate ids are checked)
//! 2. Crypto work runs unlocked
//! 3. The instance is committed under the lock, or the reservation released
//!
//! `admin` serializes the operations that replace state wholesale
//! (`start`, `stop`, `set_manifest`, `set_secrets`, `recover`).

use chrono::Utc;
use mesh_core::{template, Manifest, Marble, Package, TemplateError};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::error::CoordinatorError;
use super::state::{MarbleInstance, State, Stats, Status};
use crate::config::CoordinatorConfig;
use crate::managers::{
    AttestationVerifier, Managers, QuoteManager, RecoveryManager, ReportVerifier, SecretBundle,
    SecretManager, TlsManager,
};
use crate::storage::sealing::{self, CaSnapshot};
use crate::storage::{
    MemoryStore, SealedRecord, SealedStateStore, StateSnapshot, StorageError, SEALED_RECORD_VERSION,
};

/// A marble's request to join the mesh
#[derive(Debug, Clone, Default)]
pub struct ActivationRequest {
    pub marble_type: String,
    /// Requested instance id; empty to have one assigned
    pub instance_id: String,
    pub quote: Vec<u8>,
    /// Certificate signing request (PEM or DER) for the marble's own key
    pub csr: Option<Vec<u8>>,
}

/// Everything an admitted marble is provisioned with
pub struct ActivationResponse {
    pub instance_id: String,
    /// Primary value of every secret the marble type is entitled to
    pub secrets: BTreeMap<String, Zeroizing<Vec<u8>>>,
    pub env: BTreeMap<String, Zeroizing<String>>,
    pub files: BTreeMap<String, Zeroizing<Vec<u8>>>,
    pub argv: Vec<String>,
    pub certificate: Option<Vec<u8>>,
    pub private_key: Option<Zeroizing<Vec<u8>>>,
    pub root_ca: Option<Vec<u8>>,
}

impl std::fmt::Debug for ActivationResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivationResponse")
            .field("instance_id", &self.instance_id)
            .field("secrets", &self.secrets.keys().collect::<Vec<_>>())
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("files", &self.files.keys().collect::<Vec<_>>())
            .field("argv", &self.argv)
            .field("certificate", &self.certificate.is_some())
            .field("private_key", &self.private_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Attestation evidence and identity of the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorQuote {
    pub quote: Vec<u8>,
    pub root_ca: Vec<u8>,
    pub coordinator_cert: Vec<u8>,
}

struct Inner {
    state: State,
    managers: Option<Arc<Managers>>,
    manifest: Option<Arc<Manifest>>,
    fingerprint: Option<String>,
    instances: HashMap<String, MarbleInstance>,
    /// Activations in flight: instance id -> marble type
    pending: HashMap<String, String>,
    stats: Stats,
}

impl Inner {
    fn require(&self, expected: State, operation: &'static str) -> Result<(), CoordinatorError> {
        if self.state != expected {
            return Err(CoordinatorError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    fn managers(&self, operation: &'static str) -> Result<Arc<Managers>, CoordinatorError> {
        self.managers.clone().ok_or(CoordinatorError::InvalidState {
            operation,
            state: self.state,
        })
    }

    fn manifest(&self, operation: &'static str) -> Result<Arc<Manifest>, CoordinatorError> {
        self.manifest.clone().ok_or(CoordinatorError::InvalidState {
            operation,
            state: self.state,
        })
    }

    /// Live plus in-flight instances of one marble type
    fn count_of_type(&self, marble_type: &str) -> usize {
        let live = self
            .instances
            .values()
            .filter(|i| i.marble_type == marble_type)
            .count();
        let pending = self.pending.values().filter(|t| *t == marble_type).count();
        live + pending
    }

    fn reset(&mut self) {
        self.state = State::Uninitialized;
        self.managers = None;
        self.manifest = None;
        self.fingerprint = None;
        self.instances.clear();
        self.pending.clear();
    }
}

enum Resumed {
    Restored { manifest: Arc<Manifest>, fingerprint: String },
    Recovery,
}

/// Coordinator
pub struct Coordinator {
    config: CoordinatorConfig,
    store: Arc<dyn SealedStateStore>,
    verifier: Arc<dyn AttestationVerifier>,
    inner: RwLock<Inner>,
    admin: Mutex<()>,
}

impl Coordinator {
    /// Create a stopped coordinator with in-memory sealed state
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            store: Arc::new(MemoryStore::new()),
            verifier: Arc::new(ReportVerifier),
            inner: RwLock::new(Inner {
                state: State::Uninitialized,
                managers: None,
                manifest: None,
                fingerprint: None,
                instances: HashMap::new(),
                pending: HashMap::new(),
                stats: Stats::default(),
            }),
            admin: Mutex::new(()),
        }
    }

    /// Use a different sealed state backend
    pub fn with_store(mut self, store: Arc<dyn SealedStateStore>) -> Self {
        self.store = store;
        self
    }

    /// Use a different attestation verifier
    pub fn with_verifier(mut self, verifier: Arc<dyn AttestationVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn state(&self) -> State {
        self.inner.read().state
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create the managers and resume from sealed state if any
    ///
    /// Without sealed state the coordinator waits for a manifest. With
    /// sealed state it resumes directly when the platform key unwraps the
    /// sealing key, and otherwise waits for recovery.
    pub fn start(&self) -> Result<State, CoordinatorError> {
        let _admin = self.admin.lock();
        self.inner.read().require(State::Uninitialized, "start")?;

        let managers = Arc::new(self.build_managers()?);

        let record = if self.config.seal_mode.is_enabled() {
            self.store.load()?
        } else {
            None
        };

        let resumed = match record {
            Some(record) => Some(self.resume(&managers, record)?),
            None => None,
        };

        let mut inner = self.inner.write();
        inner.stats.start_time = Utc::now();
        inner.managers = Some(managers);
        let state = match resumed {
            None => State::AcceptingManifest,
            Some(Resumed::Recovery) => State::Recovery,
            Some(Resumed::Restored {
                manifest,
                fingerprint,
            }) => {
                inner.manifest = Some(manifest);
                inner.fingerprint = Some(fingerprint);
                State::AcceptingMarbles
            }
        };
        inner.state = state;

        info!(
            state = %inner.state,
            seal_mode = ?self.config.seal_mode,
            simulation = self.config.simulation_mode,
            "Coordinator started"
        );
        Ok(inner.state)
    }

    fn build_managers(&self) -> Result<Managers, CoordinatorError> {
        let secrets =
            SecretManager::new().map_err(|e| CoordinatorError::Initialization(e.to_string()))?;
        let tls = TlsManager::new(
            self.config.organization.clone(),
            self.config.mesh_domain.clone(),
            self.config.dns_names.clone(),
        )
        .map_err(|e| CoordinatorError::Initialization(e.to_string()))?;

        Ok(Managers {
            secrets,
            tls,
            recovery: RecoveryManager::new(self.config.recovery_threshold),
            quote: QuoteManager::new(self.config.simulation_mode, self.verifier.clone()),
        })
    }

    fn resume(&self, managers: &Managers, record: SealedRecord) -> Result<Resumed, CoordinatorError> {
        if record.version != SEALED_RECORD_VERSION {
            return Err(StorageError::UnsupportedVersion(record.version).into());
        }

        // Holders must be known even when the key cannot be unwrapped
        match managers.recovery.parse_keys(&record.recovery_keys) {
            Ok(keys) => managers.recovery.set_recovery_keys(keys),
            Err(e) => warn!(error = %e, "Sealed recovery keys unusable"),
        }

        let sealing_key = match (&self.config.platform_seal_key, &record.wrapped_key) {
            (Some(platform_key), Some(wrapped)) => {
                match sealing::unwrap_key(platform_key.as_slice(), wrapped) {
                    Ok(key) => Some(key),
                    Err(e) => {
                        warn!(error = %e, "Platform key does not unwrap the sealing key");
                        None
                    }
                }
            }
            _ => None,
        };

        let Some(sealing_key) = sealing_key else {
            warn!(
                fingerprint = %record.manifest_fingerprint,
                holders = record.recovery_keys.len(),
                "Sealed state found but sealing key unavailable; recovery required"
            );
            return Ok(Resumed::Recovery);
        };

        let snapshot = match sealing::open_state(&sealing_key, &record.state) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Sealed state does not open; recovery required");
                return Ok(Resumed::Recovery);
            }
        };

        let (manifest, fingerprint) = Self::restore_snapshot(managers, snapshot, &sealing_key)?;
        info!(fingerprint = %fingerprint, "Sealed state restored");
        Ok(Resumed::Restored {
            manifest,
            fingerprint,
        })
    }

    fn restore_snapshot(
        managers: &Managers,
        snapshot: StateSnapshot,
        sealing_key: &[u8],
    ) -> Result<(Arc<Manifest>, String), StorageError> {
        let StateSnapshot {
            manifest,
            secrets,
            mesh_ca,
        } = snapshot;

        let fingerprint = manifest
            .fingerprint()
            .map_err(|e| StorageError::Unseal(e.to_string()))?;
        let recovery_keys = managers
            .recovery
            .parse_keys(&manifest.recovery_keys)
            .map_err(|e| StorageError::Unseal(e.to_string()))?;

        managers
            .secrets
            .set_sealing_key(sealing_key)
            .map_err(|e| StorageError::Unseal(e.to_string()))?;
        managers.secrets.restore(&secrets);
        if let Some(ca) = &mesh_ca {
            managers
                .tls
                .restore_ca(&ca.cert_pem, &ca.key_pem)
                .map_err(|e| StorageError::Unseal(e.to_string()))?;
        }
        managers.tls.initialize(&manifest.tls);
        managers.recovery.set_recovery_keys(recovery_keys);

        Ok((Arc::new(manifest), fingerprint))
    }

    /// Seal current state, wipe all secrets and return to `Uninitialized`
    ///
    /// Secrets are wiped even when sealing fails; the sealing error is
    /// returned afterwards.
    pub fn stop(&self) -> Result<(), CoordinatorError> {
        let _admin = self.admin.lock();
        let (managers, manifest, fingerprint) = {
            let inner = self.inner.read();
            (
                inner.managers.clone(),
                inner.manifest.clone(),
                inner.fingerprint.clone(),
            )
        };
        let Some(managers) = managers else {
            return Ok(());
        };

        let sealed = match (&manifest, &fingerprint) {
            (Some(manifest), Some(fingerprint)) => self.seal(&managers, manifest, fingerprint),
            _ => Ok(()),
        };
        if let Err(e) = &sealed {
            error!(error = %e, "Sealing on shutdown failed");
        }

        managers.secrets.zero();
        managers.tls.zero();
        self.inner.write().reset();

        info!("Coordinator stopped");
        sealed
    }

    fn seal(&self, managers: &Managers, manifest: &Manifest, fingerprint: &str) -> Result<(), CoordinatorError> {
        if !self.config.seal_mode.is_enabled() {
            return Ok(());
        }

        let (cert_pem, key_pem) = managers
            .tls
            .export_ca()
            .map_err(|e| StorageError::Seal(e.to_string()))?;
        let snapshot = StateSnapshot {
            manifest: manifest.clone(),
            secrets: managers.secrets.snapshot(),
            mesh_ca: Some(CaSnapshot {
                cert_pem,
                key_pem: key_pem.to_string(),
            }),
        };

        let sealing_key = managers.secrets.sealing_key();
        let state = sealing::seal_state(&sealing_key, &snapshot)?;
        let wrapped_key = match &self.config.platform_seal_key {
            Some(platform_key) => Some(sealing::wrap_key(platform_key.as_slice(), &sealing_key)?),
            None => None,
        };

        let recovery_keys = managers.recovery.key_pems();
        if wrapped_key.is_none() && recovery_keys.is_empty() {
            warn!("Sealed state has neither a platform key nor recovery holders; it cannot be reopened after restart");
        }

        let record = SealedRecord {
            version: SEALED_RECORD_VERSION,
            state,
            wrapped_key,
            recovery_keys,
            manifest_fingerprint: fingerprint.to_string(),
            sealed_at: Utc::now(),
        };
        self.store.store(&record)?;

        info!(
            fingerprint = %fingerprint,
            wrapped = record.wrapped_key.is_some(),
            "Coordinator state sealed"
        );
        Ok(())
    }

    // =========================================================================
    // Manifest
    // =========================================================================

    /// Validate and install a manifest
    ///
    /// Every secret is generated and every recovery key parsed before
    /// anything is installed, so a failing manifest leaves no trace.
    /// Returns each recovery holder's encrypted copy of the sealing key.
    pub fn set_manifest(&self, manifest: Manifest) -> Result<BTreeMap<String, Vec<u8>>, CoordinatorError> {
        let _admin = self.admin.lock();
        let managers = {
            let inner = self.inner.read();
            inner.require(State::AcceptingManifest, "set_manifest")?;
            inner.managers("set_manifest")?
        };

        manifest
            .validate()
            .map_err(|e| CoordinatorError::InvalidManifest(e.to_string()))?;
        let fingerprint = manifest
            .fingerprint()
            .map_err(|e| CoordinatorError::InvalidManifest(e.to_string()))?;
        let recovery_keys = managers
            .recovery
            .parse_keys(&manifest.recovery_keys)
            .map_err(|e| CoordinatorError::InvalidManifest(e.to_string()))?;

        let staged = managers
            .secrets
            .stage(&manifest)
            .map_err(CoordinatorError::SecretGeneration)?;
        let recovery_data = recovery_keys.encrypt(&managers.secrets.sealing_key())?;

        managers.recovery.set_recovery_keys(recovery_keys);
        managers.secrets.commit(staged);
        managers.tls.initialize(&manifest.tls);

        let manifest = Arc::new(manifest);
        {
            let mut inner = self.inner.write();
            inner.manifest = Some(manifest.clone());
            inner.fingerprint = Some(fingerprint.clone());
            inner.state = State::AcceptingMarbles;
        }

        info!(
            fingerprint = %fingerprint,
            marbles = manifest.marbles.len(),
            secrets = manifest.secrets.len(),
            recovery_holders = recovery_data.len(),
            "Manifest set"
        );

        // The manifest is in force either way; state is sealed again on stop
        if let Err(e) = self.seal(&managers, &manifest, &fingerprint) {
            error!(error = %e, "Sealing after manifest update failed");
        }

        Ok(recovery_data)
    }

    /// Active manifest and its fingerprint
    pub fn get_manifest(&self) -> Option<(Arc<Manifest>, String)> {
        let inner = self.inner.read();
        match (&inner.manifest, &inner.fingerprint) {
            (Some(m), Some(fp)) => Some((m.clone(), fp.clone())),
            _ => None,
        }
    }

    // =========================================================================
    // Activation
    // =========================================================================

    /// Admit a marble instance and provision it
    pub fn activate(&self, req: ActivationRequest) -> Result<ActivationResponse, CoordinatorError> {
        let (managers, manifest, instance_id) = {
            let mut inner = self.inner.write();
            inner.require(State::AcceptingMarbles, "activate")?;
            let managers = inner.managers("activate")?;
            let manifest = inner.manifest("activate")?;

            let instance_id = if req.instance_id.trim().is_empty() {
                Uuid::new_v4().to_string()
            } else {
                req.instance_id.clone()
            };

            if let Err(e) = Self::admit(&inner, &manifest, &req.marble_type, &instance_id) {
                inner.stats.failed_activations += 1;
                warn!(
                    marble_type = %req.marble_type,
                    instance_id = %instance_id,
                    error = %e,
                    "Activation rejected"
                );
                return Err(e);
            }

            inner
                .pending
                .insert(instance_id.clone(), req.marble_type.clone());
            (managers, manifest, instance_id)
        };

        let result = Self::provision(&managers, &manifest, &req, &instance_id);

        let mut inner = self.inner.write();
        inner.pending.remove(&instance_id);

        let result = result.and_then(|response| {
            // A stop or restart while provisioning invalidates the result
            let current = inner.manifest.as_ref().is_some_and(|m| Arc::ptr_eq(m, &manifest));
            if inner.state != State::AcceptingMarbles || !current {
                managers.tls.revoke(&instance_id);
                return Err(CoordinatorError::InvalidState {
                    operation: "activate",
                    state: inner.state,
                });
            }
            Ok(response)
        });

        match result {
            Ok(response) => {
                let now = Utc::now();
                let package = manifest
                    .marbles
                    .get(&req.marble_type)
                    .map(|m| m.package.clone())
                    .unwrap_or_default();
                inner.instances.insert(
                    instance_id.clone(),
                    MarbleInstance {
                        marble_type: req.marble_type.clone(),
                        instance_id: instance_id.clone(),
                        package,
                        activated_at: now,
                        last_seen: now,
                    },
                );
                inner.stats.activation_count += 1;
                inner.stats.last_activation = Some(now);

                info!(
                    marble_type = %req.marble_type,
                    instance_id = %instance_id,
                    secrets = response.secrets.len(),
                    tls = response.certificate.is_some(),
                    "Marble activated"
                );
                Ok(response)
            }
            Err(e) => {
                inner.stats.failed_activations += 1;
                warn!(
                    marble_type = %req.marble_type,
                    instance_id = %instance_id,
                    error = %e,
                    "Activation failed"
                );
                Err(e)
            }
        }
    }

    /// Admission checks that need the instance table
    fn admit(inner: &Inner, manifest: &Manifest, marble_type: &str, instance_id: &str) -> Result<(), CoordinatorError> {
        let marble = Self::marble(manifest, marble_type)?;

        if marble.max_activations > 0 && inner.count_of_type(marble_type) >= marble.max_activations as usize {
            return Err(CoordinatorError::MaxActivationsExceeded {
                marble_type: marble_type.to_string(),
                limit: marble.max_activations,
            });
        }

        Self::package(manifest, marble)?;

        if inner.instances.contains_key(instance_id) || inner.pending.contains_key(instance_id) {
            return Err(CoordinatorError::InstanceAlreadyActive(instance_id.to_string()));
        }
        Ok(())
    }

    fn marble<'m>(manifest: &'m Manifest, marble_type: &str) -> Result<&'m Marble, CoordinatorError> {
        manifest
            .marbles
            .get(marble_type)
            .ok_or_else(|| CoordinatorError::UnknownMarbleType(marble_type.to_string()))
    }

    fn package<'m>(manifest: &'m Manifest, marble: &Marble) -> Result<&'m Package, CoordinatorError> {
        manifest
            .packages
            .get(&marble.package)
            .ok_or_else(|| CoordinatorError::UnknownPackage(marble.package.clone()))
    }

    /// Quote verification, secret rendering and certificate issuance
    fn provision(
        managers: &Managers,
        manifest: &Manifest,
        req: &ActivationRequest,
        instance_id: &str,
    ) -> Result<ActivationResponse, CoordinatorError> {
        let marble = Self::marble(manifest, &req.marble_type)?;
        let package = Self::package(manifest, marble)?;

        managers
            .quote
            .verify_quote(&req.quote, package)
            .map_err(CoordinatorError::QuoteVerificationFailed)?;

        let mut bundle = SecretBundle::default();
        let mut secrets = BTreeMap::new();
        for name in manifest.marble_secrets(&req.marble_type) {
            let material = managers.secrets.material(&name)?;
            secrets.insert(name.clone(), material.private.clone());
            bundle.0.insert(name, material);
        }

        let mut env = BTreeMap::new();
        for (key, tpl) in &marble.parameters.env {
            let value = template::render(tpl, &bundle).map_err(missing_secret)?;
            env.insert(key.clone(), Zeroizing::new(value));
        }

        let mut files = BTreeMap::new();
        for (path, tpl) in &marble.parameters.files {
            let value = template::render_bytes(tpl, &bundle).map_err(missing_secret)?;
            files.insert(path.clone(), Zeroizing::new(value));
        }

        let identity = if marble.requires_tls() {
            let issued = managers
                .tls
                .issue_certificate(&req.marble_type, instance_id, req.csr.as_deref())
                .map_err(|e| CoordinatorError::CertificateIssuanceFailed(e.to_string()))?;
            Some(issued)
        } else {
            None
        };

        let (certificate, private_key, root_ca) = match identity {
            Some(id) => (Some(id.certificate), id.private_key, Some(id.root_ca)),
            None => (None, None, None),
        };

        Ok(ActivationResponse {
            instance_id: instance_id.to_string(),
            secrets,
            env,
            files,
            argv: marble.parameters.argv.clone(),
            certificate,
            private_key,
            root_ca,
        })
    }

    /// Refresh an instance's last-seen time
    pub fn heartbeat(&self, instance_id: &str) -> Result<(), CoordinatorError> {
        let mut inner = self.inner.write();
        let instance = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| CoordinatorError::InstanceNotFound(instance_id.to_string()))?;
        instance.last_seen = Utc::now();
        Ok(())
    }

    /// Remove an instance, freeing its activation slot
    pub fn deactivate(&self, instance_id: &str) -> Result<(), CoordinatorError> {
        let (instance, managers) = {
            let mut inner = self.inner.write();
            let instance = inner
                .instances
                .remove(instance_id)
                .ok_or_else(|| CoordinatorError::InstanceNotFound(instance_id.to_string()))?;
            (instance, inner.managers.clone())
        };

        if let Some(managers) = managers {
            managers.tls.revoke(instance_id);
        }

        info!(
            marble_type = %instance.marble_type,
            instance_id = %instance_id,
            "Marble deactivated"
        );
        Ok(())
    }

    /// Live instances, oldest first
    pub fn list_instances(&self) -> Vec<MarbleInstance> {
        let mut instances: Vec<_> = self.inner.read().instances.values().cloned().collect();
        instances.sort_by(|a, b| {
            a.activated_at
                .cmp(&b.activated_at)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        instances
    }

    // =========================================================================
    // Secrets
    // =========================================================================

    /// Set one user-defined secret
    pub fn set_secret(&self, name: &str, value: &[u8]) -> Result<(), CoordinatorError> {
        let mut secrets = BTreeMap::new();
        secrets.insert(name.to_string(), value.to_vec());
        self.set_secrets(&secrets)
    }

    /// Set several user-defined secrets at once
    ///
    /// Every name is checked before any value is stored. If the new state
    /// cannot be sealed, the previous values are restored.
    pub fn set_secrets(&self, values: &BTreeMap<String, Vec<u8>>) -> Result<(), CoordinatorError> {
        let _admin = self.admin.lock();
        let (managers, manifest, fingerprint) = {
            let inner = self.inner.read();
            inner.require(State::AcceptingMarbles, "set_secret")?;
            (
                inner.managers("set_secret")?,
                inner.manifest("set_secret")?,
                inner.fingerprint.clone().unwrap_or_default(),
            )
        };

        for name in values.keys() {
            match manifest.secrets.get(name) {
                None => return Err(CoordinatorError::SecretNotFound(name.clone())),
                Some(def) if !def.user_defined => {
                    warn!(name = %name, "Rejected write to generated secret");
                    return Err(CoordinatorError::SecretNotUserDefined(name.clone()));
                }
                Some(_) => {}
            }
        }

        let previous = managers.secrets.replace_user_secrets(values);
        if let Err(e) = self.seal(&managers, &manifest, &fingerprint) {
            managers.secrets.revert_user_secrets(previous);
            error!(error = %e, "Sealing user secrets failed; previous values restored");
            return Err(e);
        }
        info!(count = values.len(), "User-defined secrets set");
        Ok(())
    }

    /// Primary values of the named secrets
    pub fn get_secrets(&self, names: &[String]) -> Result<BTreeMap<String, Zeroizing<Vec<u8>>>, CoordinatorError> {
        let managers = self.inner.read().managers("get_secrets")?;
        let mut out = BTreeMap::new();
        for name in names {
            out.insert(name.clone(), managers.secrets.get_secret(name)?);
        }
        Ok(out)
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Reopen sealed state with decrypted shares from recovery holders
    pub fn recover(&self, shares: &BTreeMap<String, Vec<u8>>) -> Result<(), CoordinatorError> {
        let _admin = self.admin.lock();
        let managers = {
            let inner = self.inner.read();
            inner.require(State::Recovery, "recover")?;
            inner.managers("recover")?
        };

        info!(shares = shares.len(), "Recovery attempt");

        let sealing_key = managers.recovery.recover_sealing_key(shares).map_err(|e| {
            warn!(error = %e, "Recovery shares rejected");
            CoordinatorError::from(e)
        })?;

        let record = self
            .store
            .load()?
            .ok_or_else(|| CoordinatorError::RecoveryUnsealFailed("no sealed state stored".into()))?;
        let snapshot = sealing::open_state(&sealing_key, &record.state).map_err(|e| {
            warn!(error = %e, "Recovered key does not open sealed state");
            CoordinatorError::RecoveryUnsealFailed(e.to_string())
        })?;
        let (manifest, fingerprint) = Self::restore_snapshot(&managers, snapshot, &sealing_key)
            .map_err(|e| CoordinatorError::RecoveryUnsealFailed(e.to_string()))?;

        {
            let mut inner = self.inner.write();
            inner.manifest = Some(manifest.clone());
            inner.fingerprint = Some(fingerprint.clone());
            inner.state = State::AcceptingMarbles;
        }

        info!(fingerprint = %fingerprint, "Coordinator recovered");

        // Refresh the wrapped key under the current platform key
        if let Err(e) = self.seal(&managers, &manifest, &fingerprint) {
            error!(error = %e, "Sealing after recovery failed");
        }
        Ok(())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn get_status(&self) -> Status {
        let inner = self.inner.read();
        let recovery_key_holders = inner
            .managers
            .as_ref()
            .map(|m| m.recovery.key_holders())
            .unwrap_or_default();

        Status {
            state: inner.state,
            manifest_fingerprint: inner.fingerprint.clone(),
            active_marbles: inner.instances.len(),
            stats: inner.stats.clone(),
            recovery_key_holders,
            seal_mode: self.config.seal_mode,
            simulation_mode: self.config.simulation_mode,
        }
    }

    /// Coordinator attestation evidence with its certificate chain
    pub fn get_quote(&self, nonce: &[u8]) -> Result<CoordinatorQuote, CoordinatorError> {
        let managers = self.inner.read().managers("get_quote")?;
        let quote = managers
            .quote
            .generate_quote(nonce)
            .map_err(CoordinatorError::Quote)?;
        let root_ca = managers
            .tls
            .root_ca_pem()
            .map_err(|e| CoordinatorError::Initialization(e.to_string()))?;
        let coordinator_cert = managers
            .tls
            .coordinator_cert_pem()
            .map_err(|e| CoordinatorError::Initialization(e.to_string()))?;

        Ok(CoordinatorQuote {
            quote,
            root_ca,
            coordinator_cert,
        })
    }
}

fn missing_secret(err: TemplateError) -> CoordinatorError {
    match err {
        TemplateError::MissingSecret { name } => CoordinatorError::SecretNotFound(name),
        TemplateError::MissingField { name, field } => {
            CoordinatorError::SecretNotFound(format!("{}.{}", name, field))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SealMode;
    use mesh_core::{Secret, SecretType, TlsEndpoint};

    fn config() -> CoordinatorConfig {
        CoordinatorConfig {
            seal_mode: SealMode::Disabled,
            ..Default::default()
        }
    }

    fn started() -> Coordinator {
        let c = Coordinator::new(config());
        assert_eq!(c.start().unwrap(), State::AcceptingManifest);
        c
    }

    fn manifest() -> Manifest {
        let mut m = Manifest::default();
        m.packages.insert(
            "pkg".into(),
            Package {
                debug: true,
                ..Default::default()
            },
        );
        m.secrets.insert("token".into(), Secret::symmetric(256));
        m.secrets.insert("password".into(), Secret::user_plain());
        let mut marble = Marble {
            package: "pkg".into(),
            max_activations: 2,
            ..Default::default()
        };
        marble
            .parameters
            .env
            .insert("TOKEN".into(), "{{ raw .Secrets.token }}".into());
        marble.parameters.argv.push("/bin/app".into());
        m.marbles.insert("svc".into(), marble);
        m
    }

    fn request(id: &str) -> ActivationRequest {
        ActivationRequest {
            marble_type: "svc".into(),
            instance_id: id.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_operations_need_start() {
        let c = Coordinator::new(config());
        assert_eq!(c.state(), State::Uninitialized);
        assert!(matches!(
            c.set_manifest(manifest()),
            Err(CoordinatorError::InvalidState { .. })
        ));
        assert!(c.get_quote(b"n").is_err());
    }

    #[test]
    fn test_start_twice_rejected() {
        let c = started();
        assert!(matches!(c.start(), Err(CoordinatorError::InvalidState { .. })));
    }

    #[test]
    fn test_activation_renders_env() {
        let c = started();
        c.set_manifest(manifest()).unwrap();

        let resp = c.activate(request("a")).unwrap();
        let token = &resp.secrets["token"];
        assert_eq!(token.len(), 32);
        assert_eq!(resp.env["TOKEN"].as_bytes(), token.as_slice());
        assert_eq!(resp.argv, vec!["/bin/app".to_string()]);
        assert!(resp.certificate.is_none());
    }

    #[test]
    fn test_empty_instance_id_is_assigned() {
        let c = started();
        c.set_manifest(manifest()).unwrap();
        let resp = c.activate(request("")).unwrap();
        assert!(Uuid::parse_str(&resp.instance_id).is_ok());
        assert_eq!(c.list_instances()[0].instance_id, resp.instance_id);
    }

    #[test]
    fn test_duplicate_instance_rejected() {
        let c = started();
        c.set_manifest(manifest()).unwrap();
        c.activate(request("a")).unwrap();
        assert!(matches!(
            c.activate(request("a")),
            Err(CoordinatorError::InstanceAlreadyActive(_))
        ));
    }

    #[test]
    fn test_deactivate_frees_slot() {
        let c = started();
        c.set_manifest(manifest()).unwrap();
        c.activate(request("a")).unwrap();
        c.activate(request("b")).unwrap();
        assert!(matches!(
            c.activate(request("c")),
            Err(CoordinatorError::MaxActivationsExceeded { limit: 2, .. })
        ));

        c.deactivate("a").unwrap();
        c.activate(request("c")).unwrap();
        assert!(matches!(
            c.deactivate("a"),
            Err(CoordinatorError::InstanceNotFound(_))
        ));
    }

    #[test]
    fn test_heartbeat() {
        let c = started();
        c.set_manifest(manifest()).unwrap();
        c.activate(request("a")).unwrap();
        let before = c.list_instances()[0].last_seen;
        c.heartbeat("a").unwrap();
        assert!(c.list_instances()[0].last_seen >= before);
        assert!(matches!(
            c.heartbeat("zzz"),
            Err(CoordinatorError::InstanceNotFound(_))
        ));
    }

    #[test]
    fn test_user_secret_flow() {
        let c = started();
        let mut m = manifest();
        m.marbles
            .get_mut("svc")
            .unwrap()
            .parameters
            .files
            .insert("/etc/pw".into(), "pw={{ .Secrets.password }}".into());
        c.set_manifest(m).unwrap();

        // Unset user secret blocks activation
        assert!(matches!(
            c.activate(request("a")),
            Err(CoordinatorError::SecretNotFound(ref n)) if n == "password"
        ));

        assert!(matches!(
            c.set_secret("token", b"x"),
            Err(CoordinatorError::SecretNotUserDefined(_))
        ));
        assert!(matches!(
            c.set_secret("ghost", b"x"),
            Err(CoordinatorError::SecretNotFound(_))
        ));

        c.set_secret("password", b"hunter2").unwrap();
        let resp = c.activate(request("a")).unwrap();
        assert_eq!(resp.files["/etc/pw"].as_slice(), b"pw=hunter2");
        assert_eq!(
            c.get_secrets(&["password".to_string()]).unwrap()["password"].as_slice(),
            b"hunter2"
        );
    }

    /// Memory store whose writes can be made to fail
    #[derive(Debug, Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failing: std::sync::atomic::AtomicBool,
    }

    impl SealedStateStore for FlakyStore {
        fn load(&self) -> Result<Option<SealedRecord>, StorageError> {
            self.inner.load()
        }

        fn store(&self, record: &SealedRecord) -> Result<(), StorageError> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(StorageError::Io("disk full".into()));
            }
            self.inner.store(record)
        }

        fn clear(&self) -> Result<(), StorageError> {
            self.inner.clear()
        }
    }

    #[test]
    fn test_failed_seal_restores_user_secret() {
        let store = Arc::new(FlakyStore::default());
        let c = Coordinator::new(CoordinatorConfig::default()).with_store(store.clone());
        c.start().unwrap();
        c.set_manifest(manifest()).unwrap();
        c.set_secret("password", b"first").unwrap();

        store.failing.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(matches!(
            c.set_secret("password", b"second"),
            Err(CoordinatorError::Storage(_))
        ));
        assert_eq!(
            c.get_secrets(&["password".to_string()]).unwrap()["password"].as_slice(),
            b"first"
        );
    }

    #[test]
    fn test_tls_marble_gets_identity() {
        let c = started();
        let mut m = manifest();
        m.secrets.insert(
            "server".into(),
            Secret::certificate(SecretType::CertEcdsa, None),
        );
        let svc = m.marbles.get_mut("svc").unwrap();
        svc.tls.incoming.push(TlsEndpoint {
            port: "8443".into(),
            cert: "server".into(),
            ..Default::default()
        });
        svc.parameters
            .files
            .insert("/tls/server.crt".into(), "{{ .Secrets.server.Cert }}".into());
        c.set_manifest(m).unwrap();

        let resp = c.activate(request("tls-1")).unwrap();
        assert!(resp.certificate.is_some());
        assert!(resp.private_key.is_some());
        assert!(String::from_utf8_lossy(&resp.files["/tls/server.crt"]).contains("CERTIFICATE"));

        let quote = c.get_quote(b"nonce");
        assert!(quote.is_err());
    }

    #[test]
    fn test_failed_activation_counts() {
        let c = started();
        c.set_manifest(manifest()).unwrap();
        let mut req = request("a");
        req.marble_type = "nope".into();
        assert!(matches!(
            c.activate(req),
            Err(CoordinatorError::UnknownMarbleType(_))
        ));
        assert_eq!(c.get_status().stats.failed_activations, 1);
        assert_eq!(c.get_status().stats.activation_count, 0);
    }

    #[test]
    fn test_invalid_manifest_leaves_state() {
        let c = started();
        let mut m = manifest();
        m.packages.clear();
        assert!(matches!(
            c.set_manifest(m),
            Err(CoordinatorError::InvalidManifest(_))
        ));
        assert_eq!(c.state(), State::AcceptingManifest);
        assert!(c.get_manifest().is_none());
    }

    #[test]
    fn test_stop_wipes_and_resets() {
        let c = started();
        c.set_manifest(manifest()).unwrap();
        c.activate(request("a")).unwrap();
        c.stop().unwrap();

        assert_eq!(c.state(), State::Uninitialized);
        assert!(c.list_instances().is_empty());
        assert!(c.get_manifest().is_none());
        // Counters persist across stop
        assert_eq!(c.get_status().stats.activation_count, 1);

        // Seal disabled: a restart begins fresh
        assert_eq!(c.start().unwrap(), State::AcceptingManifest);
    }

    #[test]
    fn test_simulation_quote() {
        let c = Coordinator::new(CoordinatorConfig {
            simulation_mode: true,
            ..config()
        });
        c.start().unwrap();
        let q = c.get_quote(b"nonce").unwrap();
        assert_eq!(q.quote, crate::managers::SIMULATED_QUOTE);
        assert!(String::from_utf8_lossy(&q.root_ca).contains("CERTIFICATE"));
        assert!(!q.coordinator_cert.is_empty());
    }
}
