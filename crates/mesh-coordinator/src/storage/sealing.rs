//! AES-256-GCM sealing of coordinator state
//!
//! Two things get sealed:
//! - the state snapshot, under the sealing key
//! - the sealing key itself, under the platform key (when configured)
//!
//! Each use binds its own associated data, so a blob sealed for one
//! purpose never opens as the other.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm,
};
use mesh_core::Manifest;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::StorageError;
use crate::managers::secrets::SecretsSnapshot;

const STATE_AAD: &[u8] = b"mesh-coordinator/state/v1";
const KEY_AAD: &[u8] = b"mesh-coordinator/sealing-key/v1";

/// Nonce and ciphertext of one AEAD seal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBlob {
    pub nonce: [u8; 12],
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Mesh root CA as stored in sealed state
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct CaSnapshot {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Everything a coordinator needs to resume after restart
#[derive(Serialize, Deserialize)]
pub struct StateSnapshot {
    pub manifest: Manifest,
    pub secrets: SecretsSnapshot,
    pub mesh_ca: Option<CaSnapshot>,
}

fn cipher(key: &[u8]) -> Result<Aes256Gcm, StorageError> {
    Aes256Gcm::new_from_slice(key)
        .map_err(|_| StorageError::Seal(format!("key must be 32 bytes, got {}", key.len())))
}

fn seal(key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<SealedBlob, StorageError> {
    let cipher = cipher(key)?;
    let mut nonce = [0u8; 12];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| StorageError::Seal(e.to_string()))?;

    let ciphertext = cipher
        .encrypt(&nonce.into(), Payload { msg: plaintext, aad })
        .map_err(|e| StorageError::Seal(format!("AES-GCM encryption failed: {}", e)))?;

    Ok(SealedBlob { nonce, ciphertext })
}

fn open(key: &[u8], blob: &SealedBlob, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, StorageError> {
    let cipher = cipher(key).map_err(|e| StorageError::Unseal(e.to_string()))?;
    let plaintext = cipher
        .decrypt(
            &blob.nonce.into(),
            Payload {
                msg: &blob.ciphertext,
                aad,
            },
        )
        .map_err(|e| StorageError::Unseal(format!("AES-GCM decryption failed: {}", e)))?;
    Ok(Zeroizing::new(plaintext))
}

/// Seal a state snapshot under the sealing key
pub fn seal_state(sealing_key: &[u8], snapshot: &StateSnapshot) -> Result<SealedBlob, StorageError> {
    let plaintext = Zeroizing::new(serde_json::to_vec(snapshot)?);
    seal(sealing_key, &plaintext, STATE_AAD)
}

/// Open a state snapshot with the sealing key
pub fn open_state(sealing_key: &[u8], blob: &SealedBlob) -> Result<StateSnapshot, StorageError> {
    let plaintext = open(sealing_key, blob, STATE_AAD)?;
    serde_json::from_slice(&plaintext).map_err(|e| StorageError::Unseal(format!("corrupt snapshot: {}", e)))
}

/// Seal the sealing key under the platform key
pub fn wrap_key(platform_key: &[u8], sealing_key: &[u8]) -> Result<SealedBlob, StorageError> {
    seal(platform_key, sealing_key, KEY_AAD)
}

/// Recover the sealing key with the platform key
pub fn unwrap_key(platform_key: &[u8], blob: &SealedBlob) -> Result<Zeroizing<Vec<u8>>, StorageError> {
    open(platform_key, blob, KEY_AAD)
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
