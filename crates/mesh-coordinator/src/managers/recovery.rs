//! Recovery Manager
//!
//! Each recovery holder receives the whole sealing key, encrypted with
//! RSA-OAEP (SHA-256) under that holder's public key. Recovery accepts the
//! key once `threshold` holders submit identical decrypted shares.
//!
//! The threshold is an operational control: any single holder already knows
//! the full key after decrypting their own share.

use parking_lot::RwLock;
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPublicKey};
use sha2::Sha256;
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Smallest accepted holder key
pub const MIN_RECOVERY_KEY_BITS: usize = 2048;

/// Errors from the recovery manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("Invalid recovery key for '{holder}': {reason}")]
    InvalidKey { holder: String, reason: String },

    #[error("Recovery threshold {threshold} exceeds the {holders} configured holders")]
    ThresholdExceedsHolders { threshold: usize, holders: usize },

    #[error("Insufficient recovery shares: got {got}, need {need}")]
    InsufficientShares { got: usize, need: usize },

    #[error("Unknown recovery key holder: {0}")]
    UnknownHolder(String),

    #[error("Recovery share from '{0}' does not match the others")]
    ShareMismatch(String),

    #[error("Encrypting recovery data for '{holder}' failed: {reason}")]
    Encryption { holder: String, reason: String },
}

/// Parsed recovery holder keys
#[derive(Debug, Clone, Default)]
pub struct RecoveryKeys {
    keys: BTreeMap<String, RsaPublicKey>,
    pems: BTreeMap<String, String>,
}

impl RecoveryKeys {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Holder names, sorted
    pub fn holders(&self) -> Vec<String> {
        self.keys.keys().cloned().collect()
    }

    /// Holder name -> public key PEM as supplied
    pub fn pems(&self) -> &BTreeMap<String, String> {
        &self.pems
    }

    /// Encrypt `sealing_key` separately for every holder
    pub fn encrypt(&self, sealing_key: &[u8]) -> Result<BTreeMap<String, Vec<u8>>, RecoveryError> {
        let mut out = BTreeMap::new();
        for (holder, key) in &self.keys {
            let ciphertext = key
                .encrypt(&mut OsRng, Oaep::new::<Sha256>(), sealing_key)
                .map_err(|e| RecoveryError::Encryption {
                    holder: holder.clone(),
                    reason: e.to_string(),
                })?;
            out.insert(holder.clone(), ciphertext);
        }
        Ok(out)
    }
}

/// Parse one RSA public key, SPKI (`PUBLIC KEY`) or PKCS#1 (`RSA PUBLIC KEY`)
fn parse_public_key(holder: &str, pem: &str) -> Result<RsaPublicKey, RecoveryError> {
    let pem = pem.trim();
    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| RecoveryError::InvalidKey {
            holder: holder.to_string(),
            reason: e.to_string(),
        })?;

    let bits = key.size() * 8;
    if bits < MIN_RECOVERY_KEY_BITS {
        return Err(RecoveryError::InvalidKey {
            holder: holder.to_string(),
            reason: format!("{} bit key below minimum {}", bits, MIN_RECOVERY_KEY_BITS),
        });
    }
    Ok(key)
}

/// Recovery Manager
pub struct RecoveryManager {
    threshold: usize,
    keys: RwLock<RecoveryKeys>,
}

impl RecoveryManager {
    /// Create a manager requiring `threshold` matching shares (at least 1)
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            keys: RwLock::new(RecoveryKeys::default()),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Parse and check holder keys without installing them
    ///
    /// A non-empty holder set smaller than the threshold could never
    /// recover and is rejected.
    pub fn parse_keys(&self, pems: &BTreeMap<String, String>) -> Result<RecoveryKeys, RecoveryError> {
        let mut parsed = RecoveryKeys::default();
        for (holder, pem) in pems {
            let key = parse_public_key(holder, pem)?;
            parsed.keys.insert(holder.clone(), key);
            parsed.pems.insert(holder.clone(), pem.clone());
        }

        if !parsed.is_empty() && parsed.len() < self.threshold {
            return Err(RecoveryError::ThresholdExceedsHolders {
                threshold: self.threshold,
                holders: parsed.len(),
            });
        }
        Ok(parsed)
    }

    /// Install holder keys
    pub fn set_recovery_keys(&self, keys: RecoveryKeys) {
        info!(
            holders = keys.len(),
            threshold = self.threshold,
            "Recovery keys installed"
        );
        *self.keys.write() = keys;
    }

    pub fn has_recovery_keys(&self) -> bool {
        !self.keys.read().is_empty()
    }

    /// Configured holder names, sorted
    pub fn key_holders(&self) -> Vec<String> {
        self.keys.read().holders()
    }

    /// Holder public keys as PEM, for sealed state
    pub fn key_pems(&self) -> BTreeMap<String, String> {
        self.keys.read().pems().clone()
    }

    /// Encrypt the sealing key for every installed holder
    pub fn generate_recovery_data(&self, sealing_key: &[u8]) -> Result<BTreeMap<String, Vec<u8>>, RecoveryError> {
        self.keys.read().encrypt(sealing_key)
    }

    /// Agree on the sealing key from decrypted holder shares
    ///
    /// The share count is checked before holder names.
    /// Shares are compared in constant time.
    pub fn recover_sealing_key(
        &self,
        shares: &BTreeMap<String, Vec<u8>>,
    ) -> Result<Zeroizing<Vec<u8>>, RecoveryError> {
        let keys = self.keys.read();

        if shares.len() < self.threshold {
            return Err(RecoveryError::InsufficientShares {
                got: shares.len(),
                need: self.threshold,
            });
        }

        if let Some(unknown) = shares.keys().find(|h| !keys.keys.contains_key(*h)) {
            warn!(holder = %unknown, "Recovery share from unknown holder");
            return Err(RecoveryError::UnknownHolder(unknown.clone()));
        }

        let mut iter = shares.iter();
        let (_, first) = iter.next().ok_or(RecoveryError::InsufficientShares {
            got: 0,
            need: self.threshold,
        })?;
        for (holder, share) in iter {
            if !bool::from(share.as_slice().ct_eq(first.as_slice())) {
                warn!(holder = %holder, "Recovery share mismatch");
                return Err(RecoveryError::ShareMismatch(holder.clone()));
            }
        }

        info!(shares = shares.len(), "Sealing key recovered");
        Ok(Zeroizing::new(first.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1::EncodeRsaPublicKey;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};
    use rsa::RsaPrivateKey;
    use std::sync::OnceLock;

    fn holder_keys() -> &'static [RsaPrivateKey] {
        static KEYS: OnceLock<Vec<RsaPrivateKey>> = OnceLock::new();
        KEYS.get_or_init(|| {
            (0..3)
                .map(|_| RsaPrivateKey::new(&mut OsRng, 2048).unwrap())
                .collect()
        })
    }

    fn pems(names: &[&str]) -> BTreeMap<String, String> {
        names
            .iter()
            .zip(holder_keys())
            .map(|(name, key)| {
                let pem = RsaPublicKey::from(key)
                    .to_public_key_pem(LineEnding::LF)
                    .unwrap();
                (name.to_string(), pem)
            })
            .collect()
    }

    fn manager(threshold: usize, names: &[&str]) -> RecoveryManager {
        let rm = RecoveryManager::new(threshold);
        let keys = rm.parse_keys(&pems(names)).unwrap();
        rm.set_recovery_keys(keys);
        rm
    }

    fn shares(names: &[&str], value: &[u8]) -> BTreeMap<String, Vec<u8>> {
        names.iter().map(|n| (n.to_string(), value.to_vec())).collect()
    }

    #[test]
    fn test_recovery_data_decrypts_to_sealing_key() {
        let rm = manager(2, &["alice", "bob"]);
        let sealing_key = [42u8; 32];
        let data = rm.generate_recovery_data(&sealing_key).unwrap();
        assert_eq!(data.len(), 2);

        let plain = holder_keys()[0]
            .decrypt(Oaep::new::<Sha256>(), &data["alice"])
            .unwrap();
        assert_eq!(plain, sealing_key);
        let plain = holder_keys()[1]
            .decrypt(Oaep::new::<Sha256>(), &data["bob"])
            .unwrap();
        assert_eq!(plain, sealing_key);
    }

    #[test]
    fn test_pkcs1_keys_accepted() {
        let rm = RecoveryManager::new(1);
        let pem = RsaPublicKey::from(&holder_keys()[0])
            .to_pkcs1_pem(LineEnding::LF)
            .unwrap();
        let mut map = BTreeMap::new();
        map.insert("carol".to_string(), pem);
        assert_eq!(rm.parse_keys(&map).unwrap().holders(), vec!["carol".to_string()]);
    }

    #[test]
    fn test_invalid_key_rejected() {
        let rm = RecoveryManager::new(1);
        let mut map = BTreeMap::new();
        map.insert("mallory".to_string(), "-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----".to_string());
        assert!(matches!(
            rm.parse_keys(&map),
            Err(RecoveryError::InvalidKey { ref holder, .. }) if holder == "mallory"
        ));
    }

    #[test]
    fn test_threshold_above_holder_count_rejected() {
        let rm = RecoveryManager::new(3);
        assert_eq!(
            rm.parse_keys(&pems(&["alice", "bob"])).unwrap_err(),
            RecoveryError::ThresholdExceedsHolders { threshold: 3, holders: 2 }
        );
        assert!(rm.parse_keys(&BTreeMap::new()).unwrap().is_empty());
    }

    #[test]
    fn test_matching_shares_recover() {
        let rm = manager(2, &["alice", "bob"]);
        let key = rm
            .recover_sealing_key(&shares(&["alice", "bob"], b"sealing-key"))
            .unwrap();
        assert_eq!(key.as_slice(), b"sealing-key");
    }

    #[test]
    fn test_insufficient_shares() {
        let rm = manager(2, &["alice", "bob"]);
        assert_eq!(
            rm.recover_sealing_key(&shares(&["alice"], b"k")).unwrap_err(),
            RecoveryError::InsufficientShares { got: 1, need: 2 }
        );
        assert_eq!(
            rm.recover_sealing_key(&BTreeMap::new()).unwrap_err(),
            RecoveryError::InsufficientShares { got: 0, need: 2 }
        );
    }

    #[test]
    fn test_unknown_holder() {
        let rm = manager(1, &["alice"]);
        assert_eq!(
            rm.recover_sealing_key(&shares(&["alice", "eve"], b"k")).unwrap_err(),
            RecoveryError::UnknownHolder("eve".into())
        );
    }

    #[test]
    fn test_share_count_checked_before_holders() {
        let rm = manager(2, &["alice", "bob"]);
        assert_eq!(
            rm.recover_sealing_key(&shares(&["eve"], b"k")).unwrap_err(),
            RecoveryError::InsufficientShares { got: 1, need: 2 }
        );
    }

    #[test]
    fn test_share_mismatch() {
        let rm = manager(2, &["alice", "bob"]);
        let mut s = shares(&["alice"], b"key-one");
        s.insert("bob".into(), b"key-two".to_vec());
        assert_eq!(
            rm.recover_sealing_key(&s).unwrap_err(),
            RecoveryError::ShareMismatch("bob".into())
        );
    }

    #[test]
    fn test_threshold_floor_is_one() {
        assert_eq!(RecoveryManager::new(0).threshold(), 1);
    }
}
